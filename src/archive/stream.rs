// ============================================
// archive/stream.rs - Single-file compressors
// ============================================
// bz2, xz and lzma (the legacy "lzma_alone" container). There is no
// directory inside, so the member name is the archive name without its
// last extension.
// ============================================

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use xz2::read::XzDecoder;
use xz2::stream::{LzmaOptions, Stream};
use xz2::write::XzEncoder;

use super::{ArchiveEntry, ArchiveError, ArchiveFormat, Reporter, Result};

const PRESET: u32 = 6;

fn lzma_error(e: xz2::stream::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn decoder(archive: &Path, format: ArchiveFormat) -> io::Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(archive)?);
    Ok(match format {
        ArchiveFormat::Bz2 => Box::new(BzDecoder::new(file)),
        ArchiveFormat::Lzma => {
            let stream = Stream::new_lzma_decoder(u64::MAX).map_err(lzma_error)?;
            Box::new(XzDecoder::new_stream(file, stream))
        }
        _ => Box::new(XzDecoder::new(file)),
    })
}

/// Name of the single member: "notes.txt.xz" holds "notes.txt"
fn member_name(archive: &Path) -> String {
    archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "output".to_string())
}

pub(super) fn create(
    output: &Path,
    sources: &[PathBuf],
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    let source = match sources {
        [single] if single.is_file() => single,
        [single] => {
            return Err(ArchiveError::SingleFileOnly {
                format,
                reason: format!("{} is a directory", single.display()),
            })
        }
        _ => {
            return Err(ArchiveError::SingleFileOnly {
                format,
                reason: format!("got {} sources", sources.len()),
            })
        }
    };

    reporter.step(format!("Compressing {}", source.display()), 10.0);
    let mut input = BufReader::new(File::open(source)?);
    let out = BufWriter::new(File::create(output)?);

    let mut out = match format {
        ArchiveFormat::Bz2 => {
            let mut enc = BzEncoder::new(out, bzip2::Compression::best());
            io::copy(&mut input, &mut enc)?;
            enc.finish()?
        }
        ArchiveFormat::Lzma => {
            let options = LzmaOptions::new_preset(PRESET).map_err(lzma_error)?;
            let stream = Stream::new_lzma_encoder(&options).map_err(lzma_error)?;
            let mut enc = XzEncoder::new_stream(out, stream);
            io::copy(&mut input, &mut enc)?;
            enc.finish()?
        }
        _ => {
            let mut enc = XzEncoder::new(out, PRESET);
            io::copy(&mut input, &mut enc)?;
            enc.finish()?
        }
    };
    out.flush()?;
    Ok(())
}

pub(super) fn extract(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    reporter: &mut Reporter,
) -> Result<()> {
    let target = dest.join(member_name(archive));
    reporter.step(format!("Decompressing to {}", target.display()), 10.0);

    let mut input = decoder(archive, format)?;
    let mut out = BufWriter::new(File::create(&target)?);
    io::copy(&mut input, &mut out)?;
    out.flush()?;
    Ok(())
}

/// One entry whose size is the decompressed length
pub(super) fn list(archive: &Path, format: ArchiveFormat) -> Result<Vec<ArchiveEntry>> {
    let mut input = decoder(archive, format)?;
    let size = io::copy(&mut input, &mut io::sink())?;
    Ok(vec![ArchiveEntry {
        name: member_name(archive),
        size,
        is_dir: false,
    }])
}
