// ============================================
// archive/external.rs - Formats handled by command-line tools
// ============================================
// rar, iso, cab, arj, lzh: read through the 7-Zip command line, with
// unrar as the fallback for RAR. Writing RAR needs the `rar` program.
//
// stdin of a helper is closed, so a tool that stops to ask for a
// password fails instead of hanging. Each tool is told up front whether
// there is a password.
// ============================================

use std::path::{Path, PathBuf};

use crate::tools::{self, HelperTool, ToolRun};

use super::{ArchiveEntry, ArchiveError, ArchiveFormat, Reporter, Result};

fn locate(tool: &HelperTool) -> Option<PathBuf> {
    tools::find_tool(tool)
}

fn run(tool: &HelperTool, program: &Path, args: &[String]) -> Result<ToolRun> {
    tools::run_tool(program, args).map_err(|e| ArchiveError::ToolFailed {
        tool: tool.display_name,
        message: e.to_string(),
    })
}

/// Turn a failed run into the most specific error we can tell apart
fn failure(
    tool: &HelperTool,
    archive: &Path,
    run: &ToolRun,
    password: Option<&str>,
) -> ArchiveError {
    let text = format!("{}\n{}", run.stdout, run.stderr).to_lowercase();
    let wrong_password = ["wrong password", "incorrect password", "can not open encrypted"]
        .iter()
        .any(|needle| text.contains(needle));
    if wrong_password {
        return match password {
            Some(_) => ArchiveError::InvalidPassword(archive.to_path_buf()),
            None => ArchiveError::PasswordRequired(archive.to_path_buf()),
        };
    }
    ArchiveError::ToolFailed {
        tool: tool.display_name,
        message: run.failure_message(),
    }
}

/// 7z reads a bare "-p" as an empty password. For unrar a bare "-p" means
/// "prompt", and "-p-" is the switch for "no password".
fn password_arg(tool: &HelperTool, password: Option<&str>) -> String {
    match password {
        Some(pw) => format!("-p{}", pw),
        None if *tool == tools::UNRAR => "-p-".to_string(),
        None => "-p".to_string(),
    }
}

pub(super) fn extract(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    password: Option<&str>,
    reporter: &mut Reporter,
) -> Result<()> {
    reporter.step(format!("Extracting {} archive...", format), 10.0);

    if let Some(seven_zip) = locate(&tools::SEVEN_ZIP) {
        let args = vec![
            "x".to_string(),
            "-y".to_string(),
            format!("-o{}", dest.display()),
            password_arg(&tools::SEVEN_ZIP, password),
            archive.display().to_string(),
        ];
        let out = run(&tools::SEVEN_ZIP, &seven_zip, &args)?;
        if !out.success {
            return Err(failure(&tools::SEVEN_ZIP, archive, &out, password));
        }
        return Ok(());
    }

    if format == ArchiveFormat::Rar {
        if let Some(unrar) = locate(&tools::UNRAR) {
            let args = vec![
                "x".to_string(),
                "-o+".to_string(),
                password_arg(&tools::UNRAR, password),
                archive.display().to_string(),
                // unrar treats a trailing separator as "extract into this directory"
                format!("{}{}", dest.display(), std::path::MAIN_SEPARATOR),
            ];
            let out = run(&tools::UNRAR, &unrar, &args)?;
            if !out.success {
                return Err(failure(&tools::UNRAR, archive, &out, password));
            }
            return Ok(());
        }
    }

    Err(ArchiveError::ToolMissing(tools::SEVEN_ZIP.display_name))
}

pub(super) fn list(archive: &Path, format: ArchiveFormat) -> Result<Vec<ArchiveEntry>> {
    if let Some(seven_zip) = locate(&tools::SEVEN_ZIP) {
        let args = vec![
            "l".to_string(),
            "-slt".to_string(),
            password_arg(&tools::SEVEN_ZIP, None),
            archive.display().to_string(),
        ];
        let out = run(&tools::SEVEN_ZIP, &seven_zip, &args)?;
        if !out.success {
            return Err(failure(&tools::SEVEN_ZIP, archive, &out, None));
        }
        return Ok(parse_slt_listing(&out.stdout));
    }

    if format == ArchiveFormat::Rar {
        if let Some(unrar) = locate(&tools::UNRAR) {
            let args = vec![
                "lb".to_string(),
                password_arg(&tools::UNRAR, None),
                archive.display().to_string(),
            ];
            let out = run(&tools::UNRAR, &unrar, &args)?;
            if !out.success {
                return Err(failure(&tools::UNRAR, archive, &out, None));
            }
            // Bare listing has names only
            return Ok(out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|name| ArchiveEntry {
                    name: name.replace('\\', "/"),
                    size: 0,
                    is_dir: false,
                })
                .collect());
        }
    }

    Err(ArchiveError::ToolMissing(tools::SEVEN_ZIP.display_name))
}

fn rar_program() -> Result<PathBuf> {
    locate(&tools::RAR).ok_or(ArchiveError::ToolMissing(tools::RAR.display_name))
}

pub(super) fn create_rar(
    output: &Path,
    sources: &[PathBuf],
    reporter: &mut Reporter,
) -> Result<()> {
    let rar = rar_program()?;
    reporter.step("Running rar...", 10.0);

    let mut args = vec![
        "a".to_string(),
        "-ep1".to_string(),
        "-r".to_string(),
        "-y".to_string(),
        output.display().to_string(),
    ];
    args.extend(sources.iter().map(|s| s.display().to_string()));

    let out = run(&tools::RAR, &rar, &args)?;
    if !out.success {
        return Err(failure(&tools::RAR, output, &out, None));
    }
    Ok(())
}

pub(super) fn add_rar(archive: &Path, file: &Path, reporter: &mut Reporter) -> Result<()> {
    // "rar a" on an existing archive appends in place
    create_rar(archive, &[file.to_path_buf()], reporter)
}

/// Parse `7z l -slt` output. Each entry is a block of "Key = Value" lines
/// after the "----------" separator, blocks separated by blank lines.
pub fn parse_slt_listing(output: &str) -> Vec<ArchiveEntry> {
    let Some((_, body)) = output.split_once("----------") else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let mut current: Option<ArchiveEntry> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        match key.trim() {
            "Path" => {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                current = Some(ArchiveEntry {
                    name: value.trim().replace('\\', "/"),
                    size: 0,
                    is_dir: false,
                });
            }
            "Size" => {
                if let Some(entry) = current.as_mut() {
                    entry.size = value.trim().parse().unwrap_or(0);
                }
            }
            "Folder" => {
                if let Some(entry) = current.as_mut() {
                    entry.is_dir = value.trim() == "+";
                }
            }
            "Attributes" => {
                // Some formats (iso) mark directories only through the attribute string
                if let Some(entry) = current.as_mut() {
                    if value.trim_start().starts_with('D') {
                        entry.is_dir = true;
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}
