// ============================================
// archive/zip.rs - ZIP and ZIPX
// ============================================
// zipx is an ordinary zip container whose members are bzip2-compressed
// instead of deflated. Encrypted members are read with the password
// given on extraction (ZipCrypto and AES).
// ============================================

use std::fs::{self, File};
use std::io;
use std::path::Path;

use ::zip::result::ZipError;
use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{
    base_name, rewrite_via_temp, safe_join, ArchiveEntry, ArchiveError, ArchiveFormat, Reporter,
    Result, SourceItem,
};

fn options_for(format: ArchiveFormat) -> SimpleFileOptions {
    let method = match format {
        ArchiveFormat::Zipx => CompressionMethod::Bzip2,
        _ => CompressionMethod::Deflated,
    };
    SimpleFileOptions::default().compression_method(method)
}

pub(super) fn create(
    output: &Path,
    items: &[SourceItem],
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    let mut writer = ZipWriter::new(File::create(output)?);
    let options = options_for(format);

    for (idx, item) in items.iter().enumerate() {
        writer.start_file(item.name.as_str(), options)?;
        let mut src = File::open(&item.source)?;
        io::copy(&mut src, &mut writer)?;
        reporter.step_of(format!("Adding {}", item.name), idx + 1, items.len());
    }

    writer.finish()?;
    Ok(())
}

pub(super) fn extract(
    archive: &Path,
    dest: &Path,
    password: Option<&str>,
    reporter: &mut Reporter,
) -> Result<()> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let total = zip.len();

    for idx in 0..total {
        let mut entry = match password {
            Some(pass) => zip.by_index_decrypt(idx, pass.as_bytes()),
            None => zip.by_index(idx),
        }
        .map_err(|e| map_password_error(archive, e, password))?;

        let name = entry.name().to_string();
        let target = safe_join(dest, &name).ok_or_else(|| ArchiveError::UnsafeEntry(name.clone()))?;

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out).map_err(|e| {
                // AES archives only find out the password was wrong once the
                // authentication code at the end of the entry fails
                if password.is_some() && e.kind() == io::ErrorKind::InvalidData {
                    ArchiveError::InvalidPassword(archive.to_path_buf())
                } else {
                    ArchiveError::Io(e)
                }
            })?;
        }
        reporter.step_of(format!("Extracting {}", name), idx + 1, total);
    }
    Ok(())
}

/// Copy every existing member into "<archive>.temp" without recompressing,
/// append the new file under its base name, then swap the files.
pub(super) fn add(
    archive: &Path,
    file: &Path,
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    let name = base_name(file)?;
    let mut existing = ZipArchive::new(File::open(archive)?)?;
    if existing.index_for_name(&name).is_some() {
        return Err(ArchiveError::DuplicateEntry {
            archive: archive.to_path_buf(),
            name,
        });
    }

    rewrite_via_temp(archive, |temp| {
        let mut writer = ZipWriter::new(File::create(temp)?);
        let total = existing.len() + 1;
        for idx in 0..existing.len() {
            let entry = existing.by_index_raw(idx)?;
            let entry_name = entry.name().to_string();
            writer.raw_copy_file(entry)?;
            reporter.step_of(format!("Copying {}", entry_name), idx + 1, total);
        }

        writer.start_file(name.as_str(), options_for(format))?;
        io::copy(&mut File::open(file)?, &mut writer)?;
        writer.finish()?;
        Ok(())
    })
}

pub(super) fn list(archive: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut entries = Vec::with_capacity(zip.len());
    for idx in 0..zip.len() {
        // Raw access reads the central directory only, so encrypted
        // archives can be listed without a password
        let entry = zip.by_index_raw(idx)?;
        entries.push(ArchiveEntry {
            name: entry.name().to_string(),
            size: entry.size(),
            is_dir: entry.is_dir(),
        });
    }
    Ok(entries)
}

fn map_password_error(archive: &Path, error: ZipError, password: Option<&str>) -> ArchiveError {
    match error {
        ZipError::UnsupportedArchive(detail) if detail == ZipError::PASSWORD_REQUIRED => {
            if password.is_none() {
                ArchiveError::PasswordRequired(archive.to_path_buf())
            } else {
                ArchiveError::InvalidPassword(archive.to_path_buf())
            }
        }
        ZipError::InvalidPassword => ArchiveError::InvalidPassword(archive.to_path_buf()),
        other => ArchiveError::Zip(other),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{assert_round_trip, file_names};
    use super::super::*;
    use super::*;
    use std::io::Write;

    #[test]
    fn test_zip_round_trip() {
        assert_round_trip(ArchiveFormat::Zip, "bundle.zip");
    }

    #[test]
    fn test_zipx_round_trip() {
        assert_round_trip(ArchiveFormat::Zipx, "bundle.zipx");
    }

    #[test]
    fn test_add_appends_and_keeps_existing() {
        let work = tempfile::tempdir().unwrap();
        let first = work.path().join("first.txt");
        let second = work.path().join("second.txt");
        fs::write(&first, b"one").unwrap();
        fs::write(&second, b"two").unwrap();

        let archive = work.path().join("a.zip");
        create_archive(&archive, &[first], ArchiveFormat::Zip, &mut Reporter::silent()).unwrap();
        add_to_archive(&archive, &second, &mut Reporter::silent()).unwrap();

        let entries = list_archive_contents(&archive).unwrap();
        assert_eq!(file_names(&entries), vec!["first.txt", "second.txt"]);
        assert!(!temp_path_for(&archive).exists());

        let out = work.path().join("out");
        extract_archive(&archive, &out, None, &mut Reporter::silent()).unwrap();
        assert_eq!(fs::read(out.join("second.txt")).unwrap(), b"two");
        assert_eq!(fs::read(out.join("first.txt")).unwrap(), b"one");
    }

    #[test]
    fn test_add_same_name_twice_is_rejected() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("same.txt");
        fs::write(&file, b"data").unwrap();

        let archive = work.path().join("a.zip");
        create_archive(&archive, &[file.clone()], ArchiveFormat::Zip, &mut Reporter::silent())
            .unwrap();
        let result = add_to_archive(&archive, &file, &mut Reporter::silent());
        assert!(matches!(result, Err(ArchiveError::DuplicateEntry { .. })));

        // Archive is unchanged
        assert_eq!(list_archive_contents(&archive).unwrap().len(), 1);
    }

    #[test]
    fn test_unsafe_entry_is_blocked() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("evil.zip");
        {
            let mut writer = ZipWriter::new(File::create(&archive).unwrap());
            writer
                .start_file("../escape.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"nope").unwrap();
            writer.finish().unwrap();
        }

        let out = work.path().join("out");
        let result = extract_archive(&archive, &out, None, &mut Reporter::silent());
        assert!(matches!(result, Err(ArchiveError::UnsafeEntry(_))));
        assert!(!work.path().join("escape.txt").exists());
    }

    #[test]
    fn test_encrypted_zip_needs_password() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("secret.zip");
        {
            let mut writer = ZipWriter::new(File::create(&archive).unwrap());
            let options = SimpleFileOptions::default()
                .with_aes_encryption(::zip::AesMode::Aes256, "hunter2");
            writer.start_file("secret.txt", options).unwrap();
            writer.write_all(b"top secret").unwrap();
            writer.finish().unwrap();
        }

        // Listing works without the password
        let entries = list_archive_contents(&archive).unwrap();
        assert_eq!(file_names(&entries), vec!["secret.txt"]);

        let out = work.path().join("a");
        let result = extract_archive(&archive, &out, None, &mut Reporter::silent());
        assert!(matches!(result, Err(ArchiveError::PasswordRequired(_))));

        let result = extract_archive(
            &archive,
            &work.path().join("b"),
            Some("wrong"),
            &mut Reporter::silent(),
        );
        assert!(matches!(result, Err(ArchiveError::InvalidPassword(_))));

        let out = work.path().join("c");
        extract_archive(&archive, &out, Some("hunter2"), &mut Reporter::silent()).unwrap();
        assert_eq!(fs::read(out.join("secret.txt")).unwrap(), b"top secret");
    }
}
