// ============================================
// archive/tar.rs - tar, tar.gz, tar.bz2, tar.xz
// ============================================
// The tar crate does the container; flate2, bzip2 and xz2 wrap the
// stream. Entries that would land outside the destination stop the
// extraction with an error.
// ============================================

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use ::tar::{Archive, Builder};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use super::{
    base_name, rewrite_via_temp, ArchiveEntry, ArchiveError, ArchiveFormat, Reporter, Result,
    SourceItem,
};

/// Compression wrapped around the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Plain,
    Gzip,
    Bzip2,
    Xz,
}

impl Codec {
    fn for_format(format: ArchiveFormat) -> Codec {
        match format {
            ArchiveFormat::TarGz => Codec::Gzip,
            ArchiveFormat::TarBz2 => Codec::Bzip2,
            ArchiveFormat::TarXz => Codec::Xz,
            _ => Codec::Plain,
        }
    }

    fn reader(self, path: &Path) -> io::Result<Box<dyn Read>> {
        let file = BufReader::new(File::open(path)?);
        Ok(match self {
            Codec::Plain => Box::new(file),
            Codec::Gzip => Box::new(GzDecoder::new(file)),
            Codec::Bzip2 => Box::new(BzDecoder::new(file)),
            Codec::Xz => Box::new(XzDecoder::new(file)),
        })
    }

    fn writer(self, path: &Path) -> io::Result<Sink> {
        let file = BufWriter::new(File::create(path)?);
        Ok(match self {
            Codec::Plain => Sink::Plain(file),
            Codec::Gzip => Sink::Gzip(GzEncoder::new(file, flate2::Compression::default())),
            Codec::Bzip2 => Sink::Bzip2(BzEncoder::new(file, bzip2::Compression::default())),
            Codec::Xz => Sink::Xz(XzEncoder::new(file, 6)),
        })
    }
}

/// Output side of a tar file. Compressed variants must be finished
/// explicitly so the trailer is written and errors are not lost in Drop.
enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Bzip2(BzEncoder<BufWriter<File>>),
    Xz(XzEncoder<BufWriter<File>>),
}

impl Sink {
    fn finish(self) -> io::Result<()> {
        let mut file = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(e) => e.finish()?,
            Sink::Bzip2(e) => e.finish()?,
            Sink::Xz(e) => e.finish()?,
        };
        file.flush()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(e) => e.write(buf),
            Sink::Bzip2(e) => e.write(buf),
            Sink::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(e) => e.flush(),
            Sink::Bzip2(e) => e.flush(),
            Sink::Xz(e) => e.flush(),
        }
    }
}

fn close(builder: Builder<Sink>) -> io::Result<()> {
    builder.into_inner()?.finish()
}

pub(super) fn create(
    output: &Path,
    items: &[SourceItem],
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    let mut builder = Builder::new(Codec::for_format(format).writer(output)?);
    for (idx, item) in items.iter().enumerate() {
        builder.append_path_with_name(&item.source, &item.name)?;
        reporter.step_of(format!("Adding {}", item.name), idx + 1, items.len());
    }
    close(builder)?;
    Ok(())
}

pub(super) fn extract(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    let codec = Codec::for_format(format);
    // One pass to count members so progress has a denominator
    let total = list(archive, format)?.len();

    let mut tar = Archive::new(codec.reader(archive)?);
    for (idx, entry) in tar.entries()?.enumerate() {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if !entry.unpack_in(dest)? {
            return Err(ArchiveError::UnsafeEntry(name));
        }
        reporter.step_of(format!("Extracting {}", name), idx + 1, total);
    }
    Ok(())
}

/// Re-write every existing member into "<archive>.temp", append the new
/// file under its base name, then swap the files. A member with the same
/// name is not replaced; the archive ends up holding both.
pub(super) fn add(
    archive: &Path,
    file: &Path,
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    let codec = Codec::for_format(format);
    let name = base_name(file)?;
    let total = list(archive, format)?.len() + 1;

    rewrite_via_temp(archive, |temp| {
        let mut builder = Builder::new(codec.writer(temp)?);
        let mut existing = Archive::new(codec.reader(archive)?);

        for (idx, entry) in existing.entries()?.enumerate() {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let mut header = entry.header().clone();
            builder.append_data(&mut header, &path, &mut entry)?;
            reporter.step_of(format!("Copying {}", path.display()), idx + 1, total);
        }

        builder.append_path_with_name(file, &name)?;
        close(builder)?;
        Ok(())
    })
}

pub(super) fn list(archive: &Path, format: ArchiveFormat) -> Result<Vec<ArchiveEntry>> {
    let mut tar = Archive::new(Codec::for_format(format).reader(archive)?);
    let mut entries = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        entries.push(ArchiveEntry {
            name: entry.path()?.to_string_lossy().into_owned(),
            size: entry.size(),
            is_dir: entry.header().entry_type().is_dir(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{assert_round_trip, file_names};
    use super::super::*;
    use crate::progress::Progress;
    use std::fs;

    #[test]
    fn test_tar_round_trip() {
        assert_round_trip(ArchiveFormat::Tar, "bundle.tar");
    }

    #[test]
    fn test_tar_gz_round_trip() {
        assert_round_trip(ArchiveFormat::TarGz, "bundle.tar.gz");
    }

    #[test]
    fn test_tgz_alias_round_trip() {
        assert_round_trip(ArchiveFormat::TarGz, "bundle.tgz");
    }

    #[test]
    fn test_tar_bz2_round_trip() {
        assert_round_trip(ArchiveFormat::TarBz2, "bundle.tar.bz2");
    }

    #[test]
    fn test_tar_xz_round_trip() {
        assert_round_trip(ArchiveFormat::TarXz, "bundle.tar.xz");
    }

    #[test]
    fn test_add_to_compressed_tar() {
        let work = tempfile::tempdir().unwrap();
        let first = work.path().join("first.txt");
        let second = work.path().join("second.txt");
        fs::write(&first, b"one").unwrap();
        fs::write(&second, b"two").unwrap();

        let archive = work.path().join("a.tar.gz");
        create_archive(&archive, &[first], ArchiveFormat::TarGz, &mut Reporter::silent()).unwrap();
        add_to_archive(&archive, &second, &mut Reporter::silent()).unwrap();

        let entries = list_archive_contents(&archive).unwrap();
        assert_eq!(file_names(&entries), vec!["first.txt", "second.txt"]);
        assert!(!temp_path_for(&archive).exists());

        let out = work.path().join("out");
        extract_archive(&archive, &out, None, &mut Reporter::silent()).unwrap();
        assert_eq!(fs::read(out.join("first.txt")).unwrap(), b"one");
        assert_eq!(fs::read(out.join("second.txt")).unwrap(), b"two");
    }

    #[test]
    fn test_adding_same_file_twice_keeps_both_members() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("same.txt");
        fs::write(&file, b"v1").unwrap();

        let archive = work.path().join("a.tar");
        create_archive(&archive, &[file.clone()], ArchiveFormat::Tar, &mut Reporter::silent())
            .unwrap();
        fs::write(&file, b"v2").unwrap();
        add_to_archive(&archive, &file, &mut Reporter::silent()).unwrap();

        let entries = list_archive_contents(&archive).unwrap();
        assert_eq!(file_names(&entries), vec!["same.txt", "same.txt"]);

        // The later member wins on extraction
        let out = work.path().join("out");
        extract_archive(&archive, &out, None, &mut Reporter::silent()).unwrap();
        assert_eq!(fs::read(out.join("same.txt")).unwrap(), b"v2");
    }

    #[test]
    fn test_parent_dir_entry_is_refused() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("evil.tar");

        // set_path refuses "..", so the name goes into the raw header
        let data = b"pwned";
        let raw_name = b"../evil.txt";
        let mut header = ::tar::Header::new_gnu();
        header.as_old_mut().name[..raw_name.len()].copy_from_slice(raw_name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(::tar::EntryType::Regular);
        header.set_cksum();
        let mut builder = ::tar::Builder::new(fs::File::create(&archive).unwrap());
        builder.append(&header, &data[..]).unwrap();
        builder.into_inner().unwrap();

        let out = work.path().join("out");
        let result = extract_archive(&archive, &out, None, &mut Reporter::silent());
        assert!(matches!(result, Err(ArchiveError::UnsafeEntry(name)) if name == "../evil.txt"));
        assert!(!work.path().join("evil.txt").exists());
    }

    #[test]
    fn test_progress_reaches_100() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let mut last = None;
        {
            let mut record = |p: Progress| last = Some(p);
            create_archive(
                &work.path().join("a.tar.xz"),
                &[file],
                ArchiveFormat::TarXz,
                &mut Reporter::new(&mut record),
            )
            .unwrap();
        }
        assert!(matches!(
            last,
            Some(Progress::Step { percent, ref message })
                if percent == 100.0 && message.starts_with("Archive created")
        ));
    }
}
