// ============================================
// Converter - download.rs
// ============================================
// Downloads the release asset chosen by updater.rs and stages it.
//
// Flow:
// 1. Work out the asset name for this machine, e.g.
//    "Converter_arm64_darwin.zip", and find its URL in the release.
// 2. Download it (with retries) into a fresh temp dir "update_<uuid>",
//    reporting progress per 8 KB chunk and honouring a cancel flag.
// 3. Unpack it there and locate the payload directory.
// 4. Write update_apply.command into ~/.converter/update/com. The script
//    waits for us to exit, copies the payload over the install dir,
//    deletes the temp dir and relaunches the app.
//
// The temp dir path is also remembered in update/state.json, so if the
// script never runs (user quits, crash) the next start of a *different*
// version still removes it.
// ============================================

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::archive;
use crate::config::{NetworkSettings, Paths};
use crate::progress::Reporter;
use crate::updater::{
    format_size, http_client, GitHubAsset, GitHubRelease, UpdateError, UpdateResult, UpdateSource,
};
use crate::version::Version;

/// Name of the downloaded archive inside the temp dir
const DOWNLOAD_FILE_NAME: &str = "update.zip";

/// Name of the generated apply script
pub const APPLY_SCRIPT_NAME: &str = "update_apply.command";

/// Read/write chunk size while streaming the download
const CHUNK_SIZE: usize = 8192;

// ============================================
// PLATFORM ASSET
// ============================================

/// "arm64" on ARM machines, "intel" for everything else
pub fn platform_arch() -> &'static str {
    if cfg!(any(target_arch = "aarch64", target_arch = "arm")) {
        "arm64"
    } else {
        "intel"
    }
}

pub fn platform_os() -> &'static str {
    if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    }
}

/// Release asset built for this machine
pub fn expected_asset_name() -> String {
    format!("Converter_{}_{}.zip", platform_arch(), platform_os())
}

/// The named asset of a release, if it has a download URL
pub fn find_asset<'a>(release: &'a GitHubRelease, asset_name: &str) -> Option<&'a GitHubAsset> {
    release
        .assets
        .iter()
        .find(|a| a.name == asset_name && !a.browser_download_url.is_empty())
}

/// What the release-by-tag request produced
#[derive(Debug)]
pub enum ReleaseLookup {
    /// Request error or a non-200 answer
    Failed,
    /// 200, but the body was not a release
    Unreadable,
    Found(GitHubRelease),
}

/// Pick the download URL for `asset_name`.
///
/// - lookup failed: use `fallback`, the conventional download URL
/// - asset listed: use its browser_download_url
/// - otherwise ask `fallback_status` for the status of `fallback`:
///   200 means use it, another status means there is nothing to
///   download, and `None` (network error) leaves it to the download
///   step to fail
pub fn choose_download_url<F>(
    lookup: ReleaseLookup,
    asset_name: &str,
    fallback: String,
    fallback_status: F,
) -> Option<String>
where
    F: FnOnce(&str) -> Option<u16>,
{
    let release = match lookup {
        ReleaseLookup::Failed => return Some(fallback),
        ReleaseLookup::Unreadable => None,
        ReleaseLookup::Found(release) => Some(release),
    };
    if let Some(asset) = release.as_ref().and_then(|r| find_asset(r, asset_name)) {
        log::info!("Found matching download: {} ({})", asset.name, format_size(asset.size));
        return Some(asset.browser_download_url.clone());
    }

    log::info!("{} not listed in the release, trying {}", asset_name, fallback);
    match fallback_status(&fallback) {
        Some(200) | None => Some(fallback),
        Some(status) => {
            log::warn!("Download URL not valid: {} (status {})", fallback, status);
            None
        }
    }
}

// ============================================
// RETRY POLICY
// ============================================

/// Fixed-delay retry: `attempts` tries in total, `delay` between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(network: &NetworkSettings) -> Self {
        RetryPolicy {
            attempts: network.retry_attempts.max(1),
            delay: Duration::from_secs(network.retry_delay_secs),
        }
    }

    /// Run `op` until it succeeds, the attempts are used up, or it fails
    /// with an error for which `retryable` is false. `op` gets the 1-based
    /// attempt number. The last error is returned.
    pub fn run_while<T, E, F, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && retryable(&e) => {
                    log::warn!("Network error (attempt {}/{}): {}", attempt, attempts, e);
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================
// STREAMING
// ============================================

/// Download progress. `percent` is only meaningful when `total > 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub percent: f32,
    pub downloaded: u64,
    pub total: u64,
}

/// Copy `reader` into `writer` in 8 KB chunks.
/// Progress is reported after each chunk when `total` is known, and the
/// cancel flag is checked before each read.
pub fn copy_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    cancel: &AtomicBool,
    on_progress: &mut dyn FnMut(DownloadProgress),
) -> Result<u64, UpdateError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut downloaded: u64 = 0;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(UpdateError::Cancelled);
        }

        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;

        if total > 0 {
            let percent = ((downloaded as f64 / total as f64) * 100.0).min(100.0) as f32;
            on_progress(DownloadProgress {
                percent,
                downloaded,
                total,
            });
        }
    }

    writer.flush()?;
    Ok(downloaded)
}

// ============================================
// PAYLOAD + APPLY SCRIPT
// ============================================

/// Where the files to install live inside the unpacked temp dir:
/// the temp dir itself if a "*.app" bundle sits at its top level,
/// otherwise the first subdirectory (by name), otherwise the temp dir.
pub fn find_payload_dir(temp_dir: &Path) -> std::io::Result<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(temp_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let has_app = dirs
        .iter()
        .any(|d| d.extension().map(|ext| ext == "app").unwrap_or(false));
    if has_app {
        return Ok(temp_dir.to_path_buf());
    }
    Ok(dirs.into_iter().next().unwrap_or_else(|| temp_dir.to_path_buf()))
}

const APPLY_SCRIPT: &str = r#"#!/bin/bash
# Converter update script (generated by Converter @VERSION@)
#
# Usage: update_apply.command <payload_dir> <install_dir> <pid> [temp_dir]

PAYLOAD_DIR="$1"
INSTALL_DIR="$2"
APP_PID="$3"
TEMP_DIR="${4:-$1}"

if [ -z "$PAYLOAD_DIR" ] || [ -z "$INSTALL_DIR" ]; then
    echo "usage: $0 <payload_dir> <install_dir> <pid> [temp_dir]" >&2
    exit 2
fi

# Wait for the running Converter to exit
if [ -n "$APP_PID" ]; then
    while kill -0 "$APP_PID" 2>/dev/null; do
        sleep 1
    done
fi

mkdir -p "$INSTALL_DIR" || exit 1
cp -R "$PAYLOAD_DIR"/. "$INSTALL_DIR"/ || exit 1

rm -rf "$TEMP_DIR"

if [ -d "$INSTALL_DIR/Converter.app" ] && command -v open >/dev/null 2>&1; then
    open "$INSTALL_DIR/Converter.app"
fi
exit 0
"#;

/// Text of update_apply.command for this build
pub fn render_apply_script() -> String {
    APPLY_SCRIPT.replace("@VERSION@", env!("CARGO_PKG_VERSION"))
}

/// Write the apply script into `staging_dir` and make it executable
pub fn write_apply_script(staging_dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(staging_dir)?;
    let path = staging_dir.join(APPLY_SCRIPT_NAME);
    fs::write(&path, render_apply_script())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }

    log::info!("Update script written to {}", path.display());
    Ok(path)
}

// ============================================
// UPDATE STATE (state.json)
// ============================================

/// Tracks which version last ran and which temp dir is waiting to be
/// removed once an update has been applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateState {
    /// Version string of the last build that ran (e.g. "2.0.0")
    #[serde(default)]
    pub last_run_version: String,

    /// Temp dir of a staged update that has not been cleaned up yet
    #[serde(default)]
    pub pending_cleanup: Option<PathBuf>,
}

impl UpdateState {
    /// Missing or unreadable state is treated as a first run
    pub fn load(path: &Path) -> UpdateState {
        fs::read_to_string(path)
            .ok()
            .and_then(|text| match serde_json::from_str::<UpdateState>(&text) {
                Ok(state) => Some(state),
                Err(e) => {
                    log::warn!("Ignoring unreadable {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Startup housekeeping. If the running version differs from the one
/// recorded last time (an update was applied) the pending temp dir is
/// removed. The current version is then recorded.
/// Returns true when the version changed since the last run.
pub fn run_startup_maintenance(paths: &Paths, current: &Version) -> bool {
    let state_path = paths.update_state_file();
    let mut state = UpdateState::load(&state_path);
    let current = current.to_string();
    let changed = state.last_run_version != current;

    if changed {
        if state.last_run_version.is_empty() {
            log::debug!("First run or state file missing");
        } else {
            log::info!("Version changed: {} -> {}", state.last_run_version, current);
        }
        if let Some(dir) = state.pending_cleanup.take() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => log::info!("Removed leftover update files: {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Could not remove {}: {}", dir.display(), e),
            }
        }
        state.last_run_version = current;
        if let Err(e) = state.save(&state_path) {
            log::warn!("Could not save update state: {}", e);
        }
    }
    changed
}

/// Remember `temp_dir` for startup cleanup. Only one dir is tracked, so
/// an older staged update that was never applied is removed now.
fn record_pending_cleanup(paths: &Paths, temp_dir: &Path) {
    let state_path = paths.update_state_file();
    let mut state = UpdateState::load(&state_path);
    if state.last_run_version.is_empty() {
        state.last_run_version = Version::current().to_string();
    }
    if let Some(old) = state.pending_cleanup.take().filter(|old| old != temp_dir) {
        log::info!("Replacing older staged update in {}", old.display());
        remove_temp_dir(&old);
    }
    state.pending_cleanup = Some(temp_dir.to_path_buf());
    if let Err(e) = state.save(&state_path) {
        log::warn!("Could not record pending cleanup: {}", e);
    }
}

// ============================================
// DOWNLOADER
// ============================================

/// A downloaded and unpacked update, ready to be applied
#[derive(Debug, Clone)]
pub struct StagedUpdate {
    pub temp_dir: PathBuf,
    pub payload_dir: PathBuf,
    pub script_path: PathBuf,
    pub version: String,
}

impl StagedUpdate {
    /// Delete the temp dir (the script stays; it is reused next time)
    pub fn cleanup(&self) {
        remove_temp_dir(&self.temp_dir);
    }
}

fn remove_temp_dir(dir: &Path) {
    if dir.exists() {
        match fs::remove_dir_all(dir) {
            Ok(()) => log::info!("Temporary files cleaned up: {}", dir.display()),
            Err(e) => log::warn!("Could not clean up {}: {}", dir.display(), e),
        }
    }
}

pub struct UpdateDownloader {
    update: UpdateResult,
    source: UpdateSource,
    paths: Paths,
    retry: RetryPolicy,
    timeout: Duration,
    temp_dir: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl UpdateDownloader {
    /// Creates the unique temp dir right away
    pub fn new(
        update: UpdateResult,
        source: UpdateSource,
        paths: Paths,
        network: &NetworkSettings,
    ) -> Result<Self, UpdateError> {
        let dir_name = format!("update_{}", uuid::Uuid::new_v4().simple());
        let temp_dir = std::env::temp_dir().join(dir_name);
        fs::create_dir_all(&temp_dir)?;
        log::debug!("Update temp dir: {}", temp_dir.display());

        Ok(UpdateDownloader {
            update,
            source,
            paths,
            retry: RetryPolicy::from_settings(network),
            timeout: Duration::from_secs(network.timeout_secs),
            temp_dir,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Share a cancel flag with the caller. Setting it from another
    /// thread (a Ctrl-C handler, say) stops the download.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Tag to look up: the raw tag name if known, else the version
    fn tag(&self) -> Option<String> {
        self.update
            .tag_name
            .clone()
            .or_else(|| self.update.latest_version.clone())
            .filter(|t| !t.is_empty())
    }

    /// Look up release `tag` and find the download URL of this machine's
    /// asset. See `choose_download_url` for the fallback rules.
    fn resolve_download_url(
        &self,
        client: &reqwest::blocking::Client,
        tag: &str,
    ) -> Option<String> {
        let asset = expected_asset_name();
        let fallback = self.source.asset_download_url(tag, &asset);
        let api_url = self.source.release_by_tag_url(tag);

        let lookup = match self.source.api_get(client, &api_url) {
            Err(e) => {
                log::warn!("Failed to query {}: {}", api_url, e);
                ReleaseLookup::Failed
            }
            Ok(r) if r.status().as_u16() != 200 => {
                log::warn!("GitHub API request failed: {} (status {})", api_url, r.status());
                ReleaseLookup::Failed
            }
            Ok(r) => r
                .text()
                .ok()
                .and_then(|text| serde_json::from_str::<GitHubRelease>(&text).ok())
                .map(ReleaseLookup::Found)
                .unwrap_or(ReleaseLookup::Unreadable),
        };

        choose_download_url(lookup, &asset, fallback, |url| {
            client.get(url).send().ok().map(|r| r.status().as_u16())
        })
    }

    /// Download, unpack and stage the update
    pub fn download_update(
        &self,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<StagedUpdate, UpdateError> {
        let tag = self.tag().ok_or(UpdateError::MissingInfo)?;
        let version = self.update.latest_version.clone().unwrap_or_else(|| tag.clone());
        let client = http_client(self.timeout)?;

        let url = self
            .resolve_download_url(&client, &tag)
            .ok_or_else(|| UpdateError::NoAsset {
                asset: expected_asset_name(),
            })?;
        log::info!("Downloading update from {}", url);

        let response = self.retry.run_while(
            |_attempt| {
                if self.cancel.load(Ordering::Relaxed) {
                    return Err(UpdateError::Cancelled);
                }
                let response = client.get(&url).send()?;
                if !response.status().is_success() {
                    return Err(UpdateError::Status {
                        status: response.status().as_u16(),
                        url: url.clone(),
                    });
                }
                Ok(response)
            },
            |e| !matches!(e, UpdateError::Cancelled),
        )?;

        let total = response.content_length().unwrap_or(0);
        let zip_path = self.temp_dir.join(DOWNLOAD_FILE_NAME);
        let mut reader = response;
        let mut writer = BufWriter::new(File::create(&zip_path)?);
        let downloaded =
            copy_with_progress(&mut reader, &mut writer, total, &self.cancel, on_progress)?;
        writer.flush()?;
        drop(writer);
        log::info!("Download complete ({} bytes), unpacking...", downloaded);

        archive::extract_archive(&zip_path, &self.temp_dir, None, &mut Reporter::silent())?;
        fs::remove_file(&zip_path)?;

        let payload_dir = find_payload_dir(&self.temp_dir)?;
        let script_path = write_apply_script(&self.paths.staging_dir())?;
        record_pending_cleanup(&self.paths, &self.temp_dir);

        log::info!("Update {} staged in {}", version, payload_dir.display());
        Ok(StagedUpdate {
            temp_dir: self.temp_dir.clone(),
            payload_dir,
            script_path,
            version,
        })
    }

    pub fn cleanup(&self) {
        remove_temp_dir(&self.temp_dir);
    }
}

/// Convenience wrapper: check the update info, download and stage it.
/// Setting `cancel` stops the download with `UpdateError::Cancelled`.
/// Any failure removes the temp dir before returning.
pub fn download_and_apply_update(
    update: &UpdateResult,
    source: UpdateSource,
    paths: Paths,
    network: &NetworkSettings,
    cancel: Arc<AtomicBool>,
    on_progress: &mut dyn FnMut(DownloadProgress),
) -> Result<StagedUpdate, UpdateError> {
    let is_set = |field: &Option<String>| field.as_deref().map(|v| !v.is_empty()).unwrap_or(false);
    if !is_set(&update.download_url) || !is_set(&update.latest_version) {
        return Err(UpdateError::MissingInfo);
    }

    let downloader = UpdateDownloader::new(update.clone(), source, paths, network)?
        .with_cancel_flag(cancel);
    match downloader.download_update(on_progress) {
        Ok(staged) => Ok(staged),
        Err(e) => {
            log::error!("Update download failed: {}", e);
            downloader.cleanup();
            Err(e)
        }
    }
}

/// Launch the apply script detached. The caller should exit afterwards so
/// the script can replace the installed files.
pub fn apply_staged_update(staged: &StagedUpdate, install_dir: &Path) -> Result<(), UpdateError> {
    log::info!(
        "Applying update {}: {} -> {}",
        staged.version,
        staged.payload_dir.display(),
        install_dir.display()
    );
    Command::new("/bin/bash")
        .arg(&staged.script_path)
        .arg(&staged.payload_dir)
        .arg(install_dir)
        .arg(std::process::id().to_string())
        .arg(&staged.temp_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}

// ============================================
// TESTS
// ============================================
