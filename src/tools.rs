// ============================================
// tools.rs - External helper programs
// ============================================
//
// A few jobs have no pure-Rust implementation we can use, so we call
// the usual command-line programs instead:
//
//   7z / 7za / 7zz   list + extract rar, iso, cab, arj, lzh
//   rar              create RAR archives and append to them
//   unrar            extract RAR when 7-Zip is not installed
//   iconutil         assemble .icns files (macOS only)
//
// Each helper is looked up on PATH first, then in the places installers
// usually put it, then next to our own executable (portable installs).
// ============================================

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

// ============================================
// HELPER DEFINITIONS
// ============================================

/// An external program we know how to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperTool {
    /// Name used in messages
    pub display_name: &'static str,
    /// Executable names to try, in order
    pub binaries: &'static [&'static str],
    /// Absolute locations to check when PATH has nothing
    pub known_locations: &'static [&'static str],
}

/// 7-Zip command line (p7zip, 7-Zip for Windows, or the standalone 7zz)
pub const SEVEN_ZIP: HelperTool = HelperTool {
    display_name: "7z",
    binaries: &["7z", "7zz", "7za"],
    known_locations: &[
        r"C:\Program Files\7-Zip\7z.exe",
        r"C:\Program Files (x86)\7-Zip\7z.exe",
        "/opt/homebrew/bin/7zz",
        "/opt/homebrew/bin/7z",
        "/usr/local/bin/7zz",
        "/usr/local/bin/7z",
        "/usr/bin/7z",
    ],
};

/// WinRAR / RAR for the command line (the only way to write RAR)
pub const RAR: HelperTool = HelperTool {
    display_name: "rar",
    binaries: &["rar"],
    known_locations: &[
        r"C:\Program Files\WinRAR\Rar.exe",
        "/opt/homebrew/bin/rar",
        "/usr/local/bin/rar",
    ],
};

pub const UNRAR: HelperTool = HelperTool {
    display_name: "unrar",
    binaries: &["unrar"],
    known_locations: &[
        r"C:\Program Files\WinRAR\UnRAR.exe",
        "/opt/homebrew/bin/unrar",
        "/usr/local/bin/unrar",
    ],
};

/// Apple's iconset -> icns compiler
pub const ICONUTIL: HelperTool = HelperTool {
    display_name: "iconutil",
    binaries: &["iconutil"],
    known_locations: &["/usr/bin/iconutil"],
};

// ============================================
// PATH HELPERS
// ============================================

/// Get the directory where the converter executable is located.
///
/// Uses std::env::current_exe() so helpers dropped next to the binary
/// are found even when the working directory is somewhere else.
pub fn get_app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        // Canonicalize to resolve any symlinks/junctions, then get parent
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            // Strip \\?\ prefix that canonicalize adds on Windows
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    log::warn!("Could not determine executable directory, using current directory");
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

// ============================================
// DISCOVERY
// ============================================

/// Find a helper program. Returns None if it is not installed anywhere we look.
pub fn find_tool(tool: &HelperTool) -> Option<PathBuf> {
    // 1. PATH
    for binary in tool.binaries {
        if let Ok(path) = which::which(binary) {
            log::debug!("Found {} on PATH: {}", tool.display_name, path.display());
            return Some(path);
        }
    }

    // 2. Well-known install locations
    for location in tool.known_locations {
        let path = PathBuf::from(location);
        if path.is_file() {
            log::debug!("Found {} at {}", tool.display_name, path.display());
            return Some(path);
        }
    }

    // 3. Next to our executable (portable installs)
    let app_dir = get_app_directory();
    for binary in tool.binaries {
        for candidate in [app_dir.join(binary), app_dir.join(format!("{}.exe", binary))] {
            if candidate.is_file() {
                log::debug!("Found bundled {} at {}", tool.display_name, candidate.display());
                return Some(candidate);
            }
        }
    }

    log::debug!("{} not found", tool.display_name);
    None
}

// ============================================
// RUNNING
// ============================================

/// Result of running a helper: exit status plus captured output as text
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolRun {
    fn from_output(output: Output) -> Self {
        ToolRun {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// The most useful text to show when the run failed
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        match self.code {
            Some(code) if detail.is_empty() => format!("exit code {}", code),
            Some(code) => format!("exit code {}: {}", code, detail),
            None if detail.is_empty() => "terminated by signal".to_string(),
            None => detail.to_string(),
        }
    }
}

/// Run a helper and capture its output. Only spawn failures are errors;
/// a non-zero exit status is reported through `ToolRun::success`.
pub fn run_tool<I, S>(program: &Path, args: I) -> std::io::Result<ToolRun>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    log::debug!("Running {:?}", command);
    let output = command.output()?;
    let run = ToolRun::from_output(output);
    log::debug!("{} exit code: {:?}", program.display(), run.code);
    Ok(run)
}
