// ============================================
// archive/sevenz.rs - 7z through sevenz-rust2
// ============================================
// The crate compresses whole directory trees, so creating an archive
// stages the sources in a scratch directory first, and adding a file
// unpacks the archive there, drops the file in and compresses again.
//
// Archives built from a directory carry an entry for that directory
// with an empty name. It stands for the destination itself and is
// skipped on extraction and in listings.
// ============================================

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sevenz_rust2::{Error as SevenZError, Password, SevenZArchiveEntry};

use super::{
    base_name, copy_recursive, is_root_entry, rewrite_via_temp, safe_join, ArchiveEntry,
    ArchiveError, Reporter, Result, ScratchDir,
};

pub(super) fn create(output: &Path, sources: &[PathBuf], reporter: &mut Reporter) -> Result<()> {
    let staging = ScratchDir::new("converter_7z")?;
    for (idx, source) in sources.iter().enumerate() {
        let name = base_name(source)?;
        copy_recursive(source, &staging.path().join(&name))?;
        reporter.step_of(format!("Staging {}", name), idx + 1, sources.len() + 1);
    }

    reporter.step("Compressing...", 90.0);
    compress(staging.path(), output)
}

fn compress(dir: &Path, output: &Path) -> Result<()> {
    sevenz_rust2::compress_to_path(dir, output).map_err(|e| ArchiveError::SevenZ(e.to_string()))
}

pub(super) fn extract(
    archive: &Path,
    dest: &Path,
    password: Option<&str>,
    reporter: &mut Reporter,
) -> Result<()> {
    let total = read_entries(archive, password)?.len();
    unpack(archive, dest, password, total, reporter)
}

/// Where an entry lands under `dest`.
/// `None` means the root directory entry, which needs no work.
fn entry_target(dest: &Path, name: &str, is_dir: bool) -> Result<Option<PathBuf>> {
    if is_dir && is_root_entry(name) {
        return Ok(None);
    }
    safe_join(dest, name)
        .map(Some)
        .ok_or_else(|| ArchiveError::UnsafeEntry(name.to_string()))
}

fn unpack(
    archive: &Path,
    dest: &Path,
    password: Option<&str>,
    total: usize,
    reporter: &mut Reporter,
) -> Result<()> {
    let file = File::open(archive)?;
    let mut done = 0usize;
    // Errors raised inside the callback that are ours rather than the crate's
    let mut failure: Option<ArchiveError> = None;

    let mut extract_fn = |entry: &SevenZArchiveEntry,
                          reader: &mut dyn Read,
                          _output_path: &PathBuf|
     -> std::result::Result<bool, SevenZError> {
        let target = match entry_target(dest, &entry.name, entry.is_directory) {
            Ok(Some(target)) => target,
            Ok(None) => return Ok(true),
            Err(e) => {
                failure = Some(e);
                return Ok(false);
            }
        };

        let written = if entry.is_directory {
            fs::create_dir_all(&target)
        } else {
            target
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| File::create(&target))
                .and_then(|mut out| io::copy(reader, &mut out).map(|_| ()))
        };
        if let Err(e) = written {
            failure = Some(ArchiveError::Io(e));
            return Ok(false);
        }

        done += 1;
        reporter.step_of(format!("Extracting {}", entry.name), done, total);
        Ok(true)
    };

    let result = match password {
        Some(pass) => sevenz_rust2::decompress_with_extract_fn_and_password(
            file,
            dest,
            Password::from(pass),
            &mut extract_fn,
        ),
        None => sevenz_rust2::decompress_with_extract_fn(file, dest, &mut extract_fn),
    };

    if let Some(err) = failure {
        return Err(err);
    }
    result.map_err(|e| map_error(archive, e, password))
}

/// Like zip, a 7z archive never holds two files with the same name: the
/// unpacked copy would be overwritten, so a clash is refused up front.
pub(super) fn add(archive: &Path, file: &Path, reporter: &mut Reporter) -> Result<()> {
    let name = base_name(file)?;
    let existing = read_entries(archive, None)?;
    if existing.iter().any(|e| e.name == name) {
        return Err(ArchiveError::DuplicateEntry {
            archive: archive.to_path_buf(),
            name,
        });
    }

    let staging = ScratchDir::new("converter_7z_add")?;
    reporter.step("Unpacking existing archive...", 10.0);
    unpack(archive, staging.path(), None, existing.len(), &mut Reporter::silent())?;

    reporter.step(format!("Adding {}", name), 50.0);
    fs::copy(file, staging.path().join(&name))?;

    reporter.step("Compressing...", 70.0);
    rewrite_via_temp(archive, |temp| compress(staging.path(), temp))
}

pub(super) fn list(archive: &Path) -> Result<Vec<ArchiveEntry>> {
    read_entries(archive, None)
}

fn read_entries(archive: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntry>> {
    let file = File::open(archive)?;
    let pw = password.map(Password::from).unwrap_or_else(Password::empty);
    let reader =
        sevenz_rust2::SevenZReader::new(file, pw).map_err(|e| map_error(archive, e, password))?;

    Ok(reader
        .archive()
        .files
        .iter()
        .filter(|e| !(e.is_directory && is_root_entry(&e.name)))
        .map(|e| ArchiveEntry {
            name: e.name.clone(),
            size: e.size,
            is_dir: e.is_directory,
        })
        .collect())
}

fn map_error(archive: &Path, error: SevenZError, password: Option<&str>) -> ArchiveError {
    match error {
        SevenZError::PasswordRequired if password.is_none() => {
            ArchiveError::PasswordRequired(archive.to_path_buf())
        }
        SevenZError::PasswordRequired | SevenZError::MaybeBadPassword(_) => {
            ArchiveError::InvalidPassword(archive.to_path_buf())
        }
        other => ArchiveError::SevenZ(other.to_string()),
    }
}
