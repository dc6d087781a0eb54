// ============================================
// archive/mod.rs - Archive format dispatch
// ============================================
//
// One entry point per operation (create / extract / add / list). Each one
// works out the format token, hands the job to the matching handler, and
// turns the outcome into progress events:
//
//   zip.rs       zip, zipx                    (zip crate)
//   tar.rs       tar, tar.gz, tar.bz2, tar.xz (tar + flate2/bzip2/xz2)
//   sevenz.rs    7z                           (sevenz-rust2)
//   stream.rs    bz2, xz, lzma                (single compressed file)
//   external.rs  rar, iso, cab, arj, lzh      (7z / rar / unrar programs)
//
// Adding a file to an existing archive rewrites the whole archive into
// "<archive>.temp" and renames it over the original. There is no
// incremental update path.
// ============================================

mod external;
mod sevenz;
mod stream;
mod tar;
mod zip;

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use walkdir::WalkDir;

use crate::progress::Reporter;

// ============================================
// FORMAT TOKEN
// ============================================

/// Every archive format the dispatcher knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZ,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Bz2,
    Xz,
    Lzma,
    Zipx,
    Iso,
    Cab,
    Arj,
    Lzh,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 15] = [
        ArchiveFormat::Zip,
        ArchiveFormat::Rar,
        ArchiveFormat::SevenZ,
        ArchiveFormat::Tar,
        ArchiveFormat::TarGz,
        ArchiveFormat::TarBz2,
        ArchiveFormat::TarXz,
        ArchiveFormat::Bz2,
        ArchiveFormat::Xz,
        ArchiveFormat::Lzma,
        ArchiveFormat::Zipx,
        ArchiveFormat::Iso,
        ArchiveFormat::Cab,
        ArchiveFormat::Arj,
        ArchiveFormat::Lzh,
    ];

    /// The format token ("zip", "tar.gz", "7z", ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::SevenZ => "7z",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::Bz2 => "bz2",
            ArchiveFormat::Xz => "xz",
            ArchiveFormat::Lzma => "lzma",
            ArchiveFormat::Zipx => "zipx",
            ArchiveFormat::Iso => "iso",
            ArchiveFormat::Cab => "cab",
            ArchiveFormat::Arj => "arj",
            ArchiveFormat::Lzh => "lzh",
        }
    }

    /// Derive the format from a file name. Compound suffixes such as
    /// ".tar.gz" are checked before the plain ones.
    pub fn from_path(path: &Path) -> Option<ArchiveFormat> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();

        const COMPOUND: [(&str, ArchiveFormat); 8] = [
            (".tar.gz", ArchiveFormat::TarGz),
            (".tgz", ArchiveFormat::TarGz),
            (".tar.bz2", ArchiveFormat::TarBz2),
            (".tbz2", ArchiveFormat::TarBz2),
            (".tbz", ArchiveFormat::TarBz2),
            (".tar.xz", ArchiveFormat::TarXz),
            (".txz", ArchiveFormat::TarXz),
            (".lha", ArchiveFormat::Lzh),
        ];
        for (suffix, format) in COMPOUND {
            if name.ends_with(suffix) {
                return Some(format);
            }
        }

        let ext = Path::new(&name).extension()?.to_str()?.to_string();
        ArchiveFormat::ALL
            .iter()
            .copied()
            .find(|f| !f.as_str().contains('.') && f.as_str() == ext)
    }

    /// Formats we can write from scratch
    pub fn can_create(&self) -> bool {
        !matches!(
            self,
            ArchiveFormat::Iso | ArchiveFormat::Cab | ArchiveFormat::Arj | ArchiveFormat::Lzh
        )
    }

    /// Formats that can take an extra file after creation
    pub fn can_add(&self) -> bool {
        self.can_create() && !self.is_single_stream()
    }

    /// bz2 / xz / lzma wrap exactly one file with no directory
    pub fn is_single_stream(&self) -> bool {
        matches!(self, ArchiveFormat::Bz2 | ArchiveFormat::Xz | ArchiveFormat::Lzma)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveFormat {
    type Err = ArchiveError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches('.').to_lowercase();
        let wanted = match wanted.as_str() {
            "tgz" => "tar.gz",
            "tbz2" | "tbz" => "tar.bz2",
            "txz" => "tar.xz",
            "lha" => "lzh",
            other => other,
        };
        ArchiveFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| ArchiveError::UnknownFormatToken(s.to_string()))
    }
}

// ============================================
// ERRORS
// ============================================

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Unknown archive format: {}", .0.display())]
    UnknownFormat(PathBuf),

    #[error("Unsupported archive format: {0}")]
    UnknownFormatToken(String),

    #[error("{operation} is not supported for {format} archives")]
    Unsupported {
        format: ArchiveFormat,
        operation: &'static str,
    },

    #[error("No source files were given")]
    NoSources,

    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("{format} holds a single file; {reason}")]
    SingleFileOnly { format: ArchiveFormat, reason: String },

    #[error("'{name}' is already in {}", .archive.display())]
    DuplicateEntry { archive: PathBuf, name: String },

    #[error("{} is password protected", .0.display())]
    PasswordRequired(PathBuf),

    #[error("Wrong password for {}", .0.display())]
    InvalidPassword(PathBuf),

    #[error("Blocked unsafe entry path: {0}")]
    UnsafeEntry(String),

    #[error("The '{0}' command is not installed")]
    ToolMissing(&'static str),

    #[error("'{tool}' failed: {message}")]
    ToolFailed { tool: &'static str, message: String },

    #[error("ZIP error: {0}")]
    Zip(#[from] ::zip::result::ZipError),

    #[error("7z error: {0}")]
    SevenZ(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

// ============================================
// LISTING
// ============================================

/// One entry inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Lines like "docs/readme.txt                              1024 bytes"
pub fn format_listing(entries: &[ArchiveEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| format!("{:<40} {:>10} bytes", e.name, e.size))
        .collect()
}

// ============================================
// PUBLIC OPERATIONS
// ============================================

/// Create `output` in `format` from the given files and directories.
///
/// Files are stored under their own name; directories are stored
/// recursively under "dirname/relative/path".
pub fn create_archive(
    output: &Path,
    sources: &[PathBuf],
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    log::info!("Creating {} archive {}", format, output.display());
    match create_inner(output, sources, format, reporter) {
        Ok(()) => {
            reporter.step(format!("Archive created: {}", output.display()), 100.0);
            Ok(())
        }
        Err(e) => {
            log::error!("Creating {} failed: {}", output.display(), e);
            reporter.fail(format!("Error creating archive: {}", e));
            Err(e)
        }
    }
}

fn create_inner(
    output: &Path,
    sources: &[PathBuf],
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    if sources.is_empty() {
        return Err(ArchiveError::NoSources);
    }
    if let Some(missing) = sources.iter().find(|s| !s.exists()) {
        return Err(ArchiveError::SourceNotFound(missing.clone()));
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    match format {
        ArchiveFormat::Zip | ArchiveFormat::Zipx => {
            let items = collect_sources(sources)?;
            zip::create(output, &items, format, reporter)
        }
        ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => {
            let items = collect_sources(sources)?;
            tar::create(output, &items, format, reporter)
        }
        ArchiveFormat::SevenZ => sevenz::create(output, sources, reporter),
        ArchiveFormat::Bz2 | ArchiveFormat::Xz | ArchiveFormat::Lzma => {
            stream::create(output, sources, format, reporter)
        }
        ArchiveFormat::Rar => external::create_rar(output, sources, reporter),
        ArchiveFormat::Iso | ArchiveFormat::Cab | ArchiveFormat::Arj | ArchiveFormat::Lzh => {
            Err(ArchiveError::Unsupported {
                format,
                operation: "Creating",
            })
        }
    }
}

/// Extract `archive` into `dest`, creating `dest` if needed.
/// The password is used by zip, 7z and the external helpers.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    password: Option<&str>,
    reporter: &mut Reporter,
) -> Result<()> {
    log::info!("Extracting {} to {}", archive.display(), dest.display());
    let result = ArchiveFormat::from_path(archive)
        .ok_or_else(|| ArchiveError::UnknownFormat(archive.to_path_buf()))
        .and_then(|format| {
            fs::create_dir_all(dest)?;
            extract_inner(archive, dest, format, password, reporter)
        });

    match result {
        Ok(()) => {
            reporter.step(format!("Archive extracted to: {}", dest.display()), 100.0);
            Ok(())
        }
        Err(e) => {
            log::error!("Extracting {} failed: {}", archive.display(), e);
            reporter.fail(format!("Error extracting archive: {}", e));
            Err(e)
        }
    }
}

fn extract_inner(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    password: Option<&str>,
    reporter: &mut Reporter,
) -> Result<()> {
    match format {
        ArchiveFormat::Zip | ArchiveFormat::Zipx => zip::extract(archive, dest, password, reporter),
        ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => {
            tar::extract(archive, dest, format, reporter)
        }
        ArchiveFormat::SevenZ => sevenz::extract(archive, dest, password, reporter),
        ArchiveFormat::Bz2 | ArchiveFormat::Xz | ArchiveFormat::Lzma => {
            stream::extract(archive, dest, format, reporter)
        }
        ArchiveFormat::Rar
        | ArchiveFormat::Iso
        | ArchiveFormat::Cab
        | ArchiveFormat::Arj
        | ArchiveFormat::Lzh => external::extract(archive, dest, format, password, reporter),
    }
}

/// Add one file (by its base name) to an existing archive.
///
/// Adding the same file twice is not idempotent: tar formats end up with
/// two members of the same name, zip refuses with `DuplicateEntry`.
pub fn add_to_archive(archive: &Path, file: &Path, reporter: &mut Reporter) -> Result<()> {
    log::info!("Adding {} to {}", file.display(), archive.display());
    let result = ArchiveFormat::from_path(archive)
        .ok_or_else(|| ArchiveError::UnknownFormat(archive.to_path_buf()))
        .and_then(|format| add_inner(archive, file, format, reporter));

    match result {
        Ok(()) => {
            reporter.step(format!("File added to archive: {}", file.display()), 100.0);
            Ok(())
        }
        Err(e) => {
            log::error!("Adding to {} failed: {}", archive.display(), e);
            reporter.fail(format!("Error adding to archive: {}", e));
            Err(e)
        }
    }
}

fn add_inner(
    archive: &Path,
    file: &Path,
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    if !file.is_file() {
        return Err(ArchiveError::SourceNotFound(file.to_path_buf()));
    }
    if !archive.is_file() {
        return Err(ArchiveError::SourceNotFound(archive.to_path_buf()));
    }
    if !format.can_add() {
        return Err(ArchiveError::Unsupported {
            format,
            operation: "Adding files",
        });
    }

    match format {
        ArchiveFormat::Zip | ArchiveFormat::Zipx => zip::add(archive, file, format, reporter),
        ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => {
            tar::add(archive, file, format, reporter)
        }
        ArchiveFormat::SevenZ => sevenz::add(archive, file, reporter),
        ArchiveFormat::Rar => external::add_rar(archive, file, reporter),
        _ => Err(ArchiveError::Unsupported {
            format,
            operation: "Adding files",
        }),
    }
}

/// List what is inside an archive
pub fn list_archive_contents(archive: &Path) -> Result<Vec<ArchiveEntry>> {
    let format = ArchiveFormat::from_path(archive)
        .ok_or_else(|| ArchiveError::UnknownFormat(archive.to_path_buf()))?;
    log::debug!("Listing {} ({})", archive.display(), format);

    match format {
        ArchiveFormat::Zip | ArchiveFormat::Zipx => zip::list(archive),
        ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => {
            tar::list(archive, format)
        }
        ArchiveFormat::SevenZ => sevenz::list(archive),
        ArchiveFormat::Bz2 | ArchiveFormat::Xz | ArchiveFormat::Lzma => stream::list(archive, format),
        ArchiveFormat::Rar
        | ArchiveFormat::Iso
        | ArchiveFormat::Cab
        | ArchiveFormat::Arj
        | ArchiveFormat::Lzh => external::list(archive, format),
    }
}

// ============================================
// SHARED HELPERS
// ============================================

/// A file scheduled for writing into a new archive
#[derive(Debug, Clone)]
pub(crate) struct SourceItem {
    /// Where the bytes come from
    pub source: PathBuf,
    /// Name inside the archive, always with '/' separators
    pub name: String,
}

/// Expand the source list into individual files with their archive names.
/// A file keeps its base name; a directory keeps its own name as prefix.
pub(crate) fn collect_sources(sources: &[PathBuf]) -> Result<Vec<SourceItem>> {
    let mut items = Vec::new();
    for source in sources {
        if source.is_file() {
            items.push(SourceItem {
                source: source.clone(),
                name: base_name(source)?,
            });
        } else if source.is_dir() {
            let base = source.parent().unwrap_or_else(|| Path::new(""));
            for entry in WalkDir::new(source).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    e.into_io_error()
                        .map(ArchiveError::Io)
                        .unwrap_or_else(|| ArchiveError::SourceNotFound(source.clone()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
                items.push(SourceItem {
                    source: entry.path().to_path_buf(),
                    name: archive_name(relative),
                });
            }
        } else {
            return Err(ArchiveError::SourceNotFound(source.clone()));
        }
    }
    Ok(items)
}

/// File name of a path as a String
pub(crate) fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ArchiveError::SourceNotFound(path.to_path_buf()))
}

/// Join the normal components of a path with '/'
pub(crate) fn archive_name(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve an entry name under `dest`, refusing anything that would
/// escape it (absolute paths, drive prefixes, "..").
pub(crate) fn safe_join(dest: &Path, entry_name: &str) -> Option<PathBuf> {
    let normalized = entry_name.replace('\\', "/");
    let mut clean = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(dest.join(clean))
}

/// True for names that resolve to the archive root itself ("", ".", "./").
/// 7z writes such an entry for the directory it was built from.
pub(crate) fn is_root_entry(entry_name: &str) -> bool {
    entry_name
        .replace('\\', "/")
        .split('/')
        .all(|part| part.is_empty() || part == ".")
}

/// "<archive>.temp" next to the archive
pub(crate) fn temp_path_for(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".temp");
    PathBuf::from(name)
}

/// Run `write` against "<archive>.temp" and, if it succeeds, move the temp
/// file over the original. On failure the temp file is removed and the
/// original archive is left untouched.
pub(crate) fn rewrite_via_temp<F>(archive: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let temp = temp_path_for(archive);
    match write(&temp) {
        Ok(()) => {
            fs::rename(&temp, archive)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

/// A scratch directory "<prefix>_<uuid>" under the system temp dir,
/// removed on drop. Shared by the 7z staging and the ICNS iconset.
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(prefix: &str) -> std::io::Result<Self> {
        let name = format!("{}_{}", prefix, uuid::Uuid::new_v4().simple());
        let path = std::env::temp_dir().join(name);
        fs::create_dir_all(&path)?;
        Ok(ScratchDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::debug!("Could not remove scratch dir {}: {}", self.path.display(), e);
        }
    }
}

/// Copy a file or directory tree
pub(crate) fn copy_recursive(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dest)?;
    }
    Ok(())
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::progress::Progress;
    use std::collections::BTreeMap;

    /// Build a small tree:
    ///   <base>/hello.txt
    ///   <base>/docs/readme.md
    ///   <base>/docs/nested/data.bin
    pub(crate) fn sample_tree(base: &Path) -> (PathBuf, PathBuf) {
        let file = base.join("hello.txt");
        fs::write(&file, b"hello world\n").unwrap();
        let dir = base.join("docs");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("readme.md"), b"# Readme\n").unwrap();
        let bytes: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.join("nested").join("data.bin"), bytes).unwrap();
        (file, dir)
    }

    /// Relative path -> contents for every file under `root`
    pub(crate) fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = archive_name(e.path().strip_prefix(root).unwrap());
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    pub(crate) fn file_names(entries: &[ArchiveEntry]) -> Vec<String> {
        let mut names: Vec<String> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name.trim_end_matches('/').to_string())
            .collect();
        names.sort();
        names
    }

    /// Create -> list -> extract and compare byte-for-byte with the sources
    pub(crate) fn assert_round_trip(format: ArchiveFormat, file_name: &str) {
        let work = tempfile::tempdir().unwrap();
        let src = work.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let (file, dir) = sample_tree(&src);

        let archive = work.path().join(file_name);
        create_archive(&archive, &[file, dir], format, &mut Reporter::silent()).unwrap();

        let entries = list_archive_contents(&archive).unwrap();
        assert_eq!(
            file_names(&entries),
            vec!["docs/nested/data.bin", "docs/readme.md", "hello.txt"],
            "listing of {}",
            format
        );

        let out = work.path().join("out");
        extract_archive(&archive, &out, None, &mut Reporter::silent()).unwrap();
        assert_eq!(read_tree(&out), read_tree(&src), "contents of {}", format);
    }

    #[test]
    fn test_format_from_path() {
        let cases = [
            ("a.zip", ArchiveFormat::Zip),
            ("A.ZIP", ArchiveFormat::Zip),
            ("a.rar", ArchiveFormat::Rar),
            ("a.7z", ArchiveFormat::SevenZ),
            ("a.tar", ArchiveFormat::Tar),
            ("a.tar.gz", ArchiveFormat::TarGz),
            ("a.tgz", ArchiveFormat::TarGz),
            ("a.tar.bz2", ArchiveFormat::TarBz2),
            ("a.tbz2", ArchiveFormat::TarBz2),
            ("a.tar.xz", ArchiveFormat::TarXz),
            ("a.txz", ArchiveFormat::TarXz),
            ("notes.txt.bz2", ArchiveFormat::Bz2),
            ("notes.txt.xz", ArchiveFormat::Xz),
            ("notes.lzma", ArchiveFormat::Lzma),
            ("a.zipx", ArchiveFormat::Zipx),
            ("disk.iso", ArchiveFormat::Iso),
            ("setup.cab", ArchiveFormat::Cab),
            ("old.arj", ArchiveFormat::Arj),
            ("old.lzh", ArchiveFormat::Lzh),
            ("old.lha", ArchiveFormat::Lzh),
        ];
        for (name, expected) in cases {
            assert_eq!(
                ArchiveFormat::from_path(Path::new(name)),
                Some(expected),
                "{}",
                name
            );
        }
        assert_eq!(ArchiveFormat::from_path(Path::new("a.txt")), None);
        assert_eq!(ArchiveFormat::from_path(Path::new("noext")), None);
        assert_eq!(ArchiveFormat::from_path(Path::new("a.gz")), None);
    }

    #[test]
    fn test_format_token_round_trip() {
        for format in ArchiveFormat::ALL {
            assert_eq!(format.as_str().parse::<ArchiveFormat>().unwrap(), format);
        }
        assert_eq!("TGZ".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert_eq!(".zip".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zip);
        assert!("gz".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_capabilities() {
        assert!(ArchiveFormat::Zip.can_add());
        assert!(ArchiveFormat::Rar.can_create());
        assert!(ArchiveFormat::Xz.can_create());
        assert!(!ArchiveFormat::Xz.can_add());
        assert!(!ArchiveFormat::Iso.can_create());
        assert!(!ArchiveFormat::Cab.can_add());
    }

    #[test]
    fn test_safe_join_blocks_escapes() {
        let dest = Path::new("/tmp/out");
        assert_eq!(safe_join(dest, "a/b.txt"), Some(PathBuf::from("/tmp/out/a/b.txt")));
        assert_eq!(safe_join(dest, "./a.txt"), Some(PathBuf::from("/tmp/out/a.txt")));
        assert_eq!(safe_join(dest, "a\\b.txt"), Some(PathBuf::from("/tmp/out/a/b.txt")));
        assert_eq!(safe_join(dest, "../evil.txt"), None);
        assert_eq!(safe_join(dest, "a/../../evil.txt"), None);
        assert_eq!(safe_join(dest, "/etc/passwd"), None);
        assert_eq!(safe_join(dest, ""), None);
    }

    #[test]
    fn test_root_entry_names() {
        assert!(is_root_entry(""));
        assert!(is_root_entry("."));
        assert!(is_root_entry("./"));
        assert!(!is_root_entry("a"));
        assert!(!is_root_entry(".."));
        assert!(!is_root_entry("./a.txt"));
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let scratch = ScratchDir::new("converter_test").unwrap();
        let path = scratch.path().to_path_buf();
        fs::write(path.join("x.txt"), b"x").unwrap();
        assert!(path.is_dir());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("converter_test_"));

        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_format_listing_alignment() {
        let lines = format_listing(&[ArchiveEntry {
            name: "hello.txt".to_string(),
            size: 12,
            is_dir: false,
        }]);
        assert_eq!(lines[0], format!("{:<40} {:>10} bytes", "hello.txt", 12));
        assert!(lines[0].ends_with("        12 bytes"));
    }

    #[test]
    fn test_create_reports_failure_for_missing_source() {
        let work = tempfile::tempdir().unwrap();
        let mut events = Vec::new();
        let result = {
            let mut record = |p: Progress| events.push(p);
            create_archive(
                &work.path().join("out.zip"),
                &[work.path().join("missing.txt")],
                ArchiveFormat::Zip,
                &mut Reporter::new(&mut record),
            )
        };
        assert!(matches!(result, Err(ArchiveError::SourceNotFound(_))));
        assert!(matches!(
            events.last(),
            Some(Progress::Failed { message }) if message.starts_with("Error creating archive")
        ));
    }

    #[test]
    fn test_create_rejects_empty_sources() {
        let work = tempfile::tempdir().unwrap();
        let result = create_archive(
            &work.path().join("out.tar"),
            &[],
            ArchiveFormat::Tar,
            &mut Reporter::silent(),
        );
        assert!(matches!(result, Err(ArchiveError::NoSources)));
    }

    #[test]
    fn test_create_unsupported_format() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let result = create_archive(
            &work.path().join("out.iso"),
            &[file],
            ArchiveFormat::Iso,
            &mut Reporter::silent(),
        );
        assert!(matches!(result, Err(ArchiveError::Unsupported { .. })));
    }

    #[test]
    fn test_extract_unknown_format() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let out = work.path().join("out");
        let result = extract_archive(&file, &out, None, &mut Reporter::silent());
        assert!(matches!(result, Err(ArchiveError::UnknownFormat(_))));
    }

    #[test]
    fn test_add_to_single_stream_is_unsupported() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let archive = work.path().join("a.txt.xz");
        create_archive(&archive, &[file.clone()], ArchiveFormat::Xz, &mut Reporter::silent())
            .unwrap();
        let result = add_to_archive(&archive, &file, &mut Reporter::silent());
        assert!(matches!(result, Err(ArchiveError::Unsupported { .. })));
    }

    #[test]
    fn test_collect_sources_names() {
        let work = tempfile::tempdir().unwrap();
        let (file, dir) = sample_tree(work.path());
        let items = collect_sources(&[file, dir]).unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["hello.txt", "docs/nested/data.bin", "docs/readme.md"]);
    }

    #[test]
    fn test_rewrite_via_temp_keeps_original_on_error() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("a.zip");
        fs::write(&archive, b"original").unwrap();

        let result = rewrite_via_temp(&archive, |temp| {
            fs::write(temp, b"partial")?;
            Err(ArchiveError::NoSources)
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&archive).unwrap(), b"original");
        assert!(!temp_path_for(&archive).exists());

        rewrite_via_temp(&archive, |temp| {
            fs::write(temp, b"replaced")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fs::read(&archive).unwrap(), b"replaced");
    }
}
