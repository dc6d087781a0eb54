// ============================================
// Converter - updater.rs
// ============================================
// Checks GitHub Releases for a newer Converter.
//
// How it works:
// 1. Call the GitHub API for the full release list of the repository
//    (not just /latest, because pre-releases must be considered too).
// 2. Drop releases the user did not opt into (pre-releases, channels
//    below the configured one) and tags that are not valid versions.
// 3. Keep the highest remaining version and compare it with ours.
//
// The downloader in download.rs takes the UpdateResult from here and
// fetches the platform asset for that release.
// ============================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::archive::ArchiveError;
use crate::config::Settings;
use crate::version::{Channel, Version, VersionError};

/// User-Agent sent with every request (GitHub rejects requests without one)
const USER_AGENT: &str = concat!("Converter/", env!("CARGO_PKG_VERSION"));

// ============================================
// ERRORS
// ============================================

/// Everything that can go wrong while checking for, downloading or
/// staging an update.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("invalid release data: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("The update information has no download URL or version")]
    MissingInfo,

    #[error("No download URL could be found for {asset}")]
    NoAsset { asset: String },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Could not unpack the update: {0}")]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================
// DATA STRUCTURES
// ============================================

/// Information about a GitHub release.
/// Only the fields we use are listed; serde ignores the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    /// The release tag, e.g. "v2.0.0B3"
    pub tag_name: String,

    /// Release notes (markdown). May be missing.
    #[serde(default)]
    pub body: Option<String>,

    /// GitHub's own pre-release checkbox
    #[serde(default)]
    pub prerelease: bool,

    /// The release page on github.com
    #[serde(default)]
    pub html_url: String,

    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// A single downloadable file attached to a release
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    UpdateAvailable,
    Latest,
    NoUpdates,
    Error,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStatus::UpdateAvailable => "update_available",
            UpdateStatus::Latest => "latest",
            UpdateStatus::NoUpdates => "no_updates",
            UpdateStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of an update check. Only `UpdateAvailable` fills the
/// download fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    pub status: UpdateStatus,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_body: Option<String>,

    /// Raw tag of the chosen release, used to look up its assets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
}

impl UpdateResult {
    pub fn error(message: impl Into<String>) -> Self {
        UpdateResult {
            status: UpdateStatus::Error,
            message: message.into(),
            download_url: None,
            latest_version: None,
            release_body: None,
            tag_name: None,
        }
    }

    fn from_check_error(err: UpdateError) -> Self {
        match err {
            UpdateError::Version(e) => {
                UpdateResult::error(format!("Version parsing failed: {}", e))
            }
            other => UpdateResult::error(format!("Update check failed: {}", other)),
        }
    }

    pub fn is_update_available(&self) -> bool {
        self.status == UpdateStatus::UpdateAvailable
    }
}

// ============================================
// RELEASE SOURCE
// ============================================

/// Which repository to ask and how
#[derive(Debug, Clone)]
pub struct UpdateSource {
    pub owner: String,
    pub repo: String,
    pub token: Option<String>,
    pub api_base: String,
    pub timeout: Duration,
}

impl UpdateSource {
    pub fn from_settings(settings: &Settings) -> Self {
        UpdateSource {
            owner: settings.update.owner.clone(),
            repo: settings.update.repo.clone(),
            token: settings.github_token(),
            api_base: settings.update.api_base.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(settings.network.check_timeout_secs),
        }
    }

    pub fn releases_url(&self) -> String {
        format!("{}/repos/{}/{}/releases", self.api_base, self.owner, self.repo)
    }

    pub fn release_by_tag_url(&self, tag: &str) -> String {
        format!("{}/tags/{}", self.releases_url(), tag)
    }

    /// Direct download link GitHub serves for every release asset
    pub fn asset_download_url(&self, tag: &str, asset: &str) -> String {
        format!(
            "https://github.com/{}/{}/releases/download/{}/{}",
            self.owner, self.repo, tag, asset
        )
    }

    /// GET a GitHub API URL with the usual headers (and the token, if any)
    pub(crate) fn api_get(
        &self,
        client: &reqwest::blocking::Client,
        url: &str,
    ) -> reqwest::Result<reqwest::blocking::Response> {
        let mut request = client
            .get(url)
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {}", token));
        }
        request.send()
    }
}

/// Blocking client with our User-Agent. Used for API calls and downloads.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

// ============================================
// RELEASE SELECTION
// ============================================

/// Which releases are acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseFilter {
    /// Consider releases GitHub flags as pre-releases
    pub include_prerelease: bool,
    /// Ignore versions from channels below this one
    pub lowest_channel: Channel,
}

impl ReleaseFilter {
    pub fn new(include_prerelease: bool) -> Self {
        ReleaseFilter {
            include_prerelease,
            lowest_channel: Channel::Alpha,
        }
    }

    /// Everything at or above `channel`; `Stable` means stable releases only
    pub fn for_channel(channel: Channel) -> Self {
        ReleaseFilter {
            include_prerelease: channel.is_prerelease(),
            lowest_channel: channel,
        }
    }

    fn accepts(&self, release: &GitHubRelease, version: &Version) -> bool {
        if release.prerelease && !self.include_prerelease {
            return false;
        }
        version.channel >= self.lowest_channel
    }
}

/// Pick the best release for `current` out of the list GitHub returned.
pub fn select_update(
    releases: &[GitHubRelease],
    current: &Version,
    filter: ReleaseFilter,
) -> UpdateResult {
    let best = releases
        .iter()
        .filter_map(|release| match Version::from_tag(&release.tag_name) {
            Ok(v) => Some((v, release)),
            Err(e) => {
                log::debug!("Skipping release '{}': {}", release.tag_name, e);
                None
            }
        })
        .filter(|(version, release)| filter.accepts(release, version))
        .max_by(|a, b| a.0.cmp(&b.0));

    match best {
        Some((version, release)) if version > *current => {
            let latest = version.to_string();
            log::info!("Update available: {} -> {}", current, latest);
            UpdateResult {
                status: UpdateStatus::UpdateAvailable,
                message: format!("New version available: {}!", latest),
                download_url: Some(release.html_url.clone()),
                latest_version: Some(latest),
                release_body: Some(release.body.clone().unwrap_or_default()),
                tag_name: Some(release.tag_name.clone()),
            }
        }
        Some(_) => UpdateResult {
            status: UpdateStatus::Latest,
            message: format!("You are running the latest version ({}).", current),
            download_url: None,
            latest_version: Some(current.to_string()),
            release_body: None,
            tag_name: None,
        },
        None => UpdateResult {
            status: UpdateStatus::NoUpdates,
            message: "No suitable updates found.".to_string(),
            download_url: None,
            latest_version: Some("N/A".to_string()),
            release_body: None,
            tag_name: None,
        },
    }
}

// ============================================
// UPDATE MANAGER
// ============================================

pub struct UpdateManager {
    current: Version,
    source: UpdateSource,
}

impl UpdateManager {
    pub fn new(current: Version, source: UpdateSource) -> Self {
        UpdateManager { current, source }
    }

    /// Where releases are looked up; the downloader reuses it
    pub fn source(&self) -> &UpdateSource {
        &self.source
    }

    /// Check GitHub for a newer release.
    /// Never fails: problems are reported as an `Error` status.
    pub fn check_for_updates(&self, include_prerelease: bool) -> UpdateResult {
        self.check_with(ReleaseFilter::new(include_prerelease))
    }

    /// Like `check_for_updates`, but only accept `channel` or better
    pub fn check_for_channel(&self, channel: Channel) -> UpdateResult {
        self.check_with(ReleaseFilter::for_channel(channel))
    }

    fn check_with(&self, filter: ReleaseFilter) -> UpdateResult {
        log::info!(
            "Checking {} for updates (current {}, filter {:?})",
            self.source.releases_url(),
            self.current,
            filter
        );
        match self.fetch_releases() {
            Ok(releases) => select_update(&releases, &self.current, filter),
            Err(e) => {
                log::warn!("Update check failed: {}", e);
                UpdateResult::from_check_error(e)
            }
        }
    }

    /// All releases of the repository, newest first as GitHub returns them
    pub fn fetch_releases(&self) -> Result<Vec<GitHubRelease>, UpdateError> {
        let client = http_client(self.source.timeout)?;
        let url = self.source.releases_url();
        let response = self.source.api_get(&client, &url)?;

        // 404 = no such repo, 403 = rate limited, ...
        if !response.status().is_success() {
            return Err(UpdateError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        // Read as text and parse ourselves (no reqwest "json" feature)
        let body = response.text()?;
        let releases: Vec<GitHubRelease> = serde_json::from_str(&body)?;
        log::debug!("GitHub returned {} releases", releases.len());
        Ok(releases)
    }
}

// ============================================
// FILE SIZE FORMATTING
// ============================================

/// Format a byte count as a human-readable size string.
///
/// Examples:
///   format_size(9_000_000) => "8.6 MB"
///   format_size(512_000)   => "500 KB"
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASES_JSON: &str = r#"[
        {"tag_name": "v2.1.0B2", "prerelease": true, "html_url": "https://github.com/pyquick/Converter/releases/tag/v2.1.0B2", "body": "beta notes", "assets": []},
        {"tag_name": "v2.0.1", "prerelease": false, "html_url": "https://github.com/pyquick/Converter/releases/tag/v2.0.1", "body": "stable notes",
         "assets": [{"name": "Converter_arm64_darwin.zip", "browser_download_url": "https://example.invalid/a.zip", "size": 1234}]},
        {"tag_name": "v2.1.0A1", "prerelease": true, "html_url": "https://github.com/pyquick/Converter/releases/tag/v2.1.0A1", "body": null},
        {"tag_name": "nightly-2024", "prerelease": true, "html_url": "x"},
        {"tag_name": "v2.0.0", "prerelease": false, "html_url": "https://github.com/pyquick/Converter/releases/tag/v2.0.0"}
    ]"#;

    fn releases() -> Vec<GitHubRelease> {
        serde_json::from_str(RELEASES_JSON).unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_stable_only_picks_highest_stable() {
        let result = select_update(&releases(), &v("2.0.0"), ReleaseFilter::new(false));
        assert_eq!(result.status, UpdateStatus::UpdateAvailable);
        assert_eq!(result.message, "New version available: 2.0.1!");
        assert_eq!(result.latest_version.as_deref(), Some("2.0.1"));
        assert_eq!(result.tag_name.as_deref(), Some("v2.0.1"));
        assert_eq!(result.release_body.as_deref(), Some("stable notes"));
        assert_eq!(
            result.download_url.as_deref(),
            Some("https://github.com/pyquick/Converter/releases/tag/v2.0.1")
        );
    }

    #[test]
    fn test_prerelease_opt_in_picks_beta() {
        let result = select_update(&releases(), &v("2.0.0"), ReleaseFilter::new(true));
        assert_eq!(result.latest_version.as_deref(), Some("2.1.0B2"));
        assert_eq!(result.tag_name.as_deref(), Some("v2.1.0B2"));
    }

    #[test]
    fn test_channel_filter() {
        // Beta or better: B2 qualifies
        let result = select_update(&releases(), &v("2.0.0"), ReleaseFilter::for_channel(Channel::Beta));
        assert_eq!(result.latest_version.as_deref(), Some("2.1.0B2"));

        // RC or better: only stable releases remain
        let result = select_update(&releases(), &v("2.0.0"), ReleaseFilter::for_channel(Channel::Rc));
        assert_eq!(result.latest_version.as_deref(), Some("2.0.1"));

        let result = select_update(&releases(), &v("2.0.1"), ReleaseFilter::for_channel(Channel::Stable));
        assert_eq!(result.status, UpdateStatus::Latest);
    }

    #[test]
    fn test_running_latest() {
        let result = select_update(&releases(), &v("2.0.1"), ReleaseFilter::new(false));
        assert_eq!(result.status, UpdateStatus::Latest);
        assert_eq!(result.message, "You are running the latest version (2.0.1).");
        assert_eq!(result.latest_version.as_deref(), Some("2.0.1"));
        assert!(result.download_url.is_none());
    }

    #[test]
    fn test_newer_local_build_is_latest() {
        let result = select_update(&releases(), &v("3.0.0A1"), ReleaseFilter::new(true));
        assert_eq!(result.status, UpdateStatus::Latest);
    }

    #[test]
    fn test_no_suitable_releases() {
        let only_pre: Vec<GitHubRelease> = releases().into_iter().filter(|r| r.prerelease).collect();
        let result = select_update(&only_pre, &v("2.0.0"), ReleaseFilter::new(false));
        assert_eq!(result.status, UpdateStatus::NoUpdates);
        assert_eq!(result.message, "No suitable updates found.");
        assert_eq!(result.latest_version.as_deref(), Some("N/A"));

        let result = select_update(&[], &v("2.0.0"), ReleaseFilter::new(true));
        assert_eq!(result.status, UpdateStatus::NoUpdates);
    }

    #[test]
    fn test_error_messages() {
        let result = UpdateResult::from_check_error(UpdateError::Status {
            status: 403,
            url: "https://api.github.com/repos/a/b/releases".to_string(),
        });
        assert_eq!(result.status, UpdateStatus::Error);
        assert!(result.message.starts_with("Update check failed: GitHub returned status 403"));

        let result = UpdateResult::from_check_error(UpdateError::Version(VersionError::Malformed("x".into())));
        assert!(result.message.starts_with("Version parsing failed:"));
    }

    #[test]
    fn test_result_json_shape() {
        let result = select_update(&releases(), &v("2.0.1"), ReleaseFilter::new(false));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "latest");
        assert!(json.get("download_url").is_none());
    }

    #[test]
    fn test_source_urls() {
        let source = UpdateSource::from_settings(&Settings::default());
        assert_eq!(source.releases_url(), "https://api.github.com/repos/pyquick/Converter/releases");
        assert_eq!(
            source.release_by_tag_url("v2.0.0"),
            "https://api.github.com/repos/pyquick/Converter/releases/tags/v2.0.0"
        );
        assert_eq!(
            source.asset_download_url("v2.0.0", "Converter_intel_darwin.zip"),
            "https://github.com/pyquick/Converter/releases/download/v2.0.0/Converter_intel_darwin.zip"
        );
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(500), "500 bytes");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1_048_576), "1.0 MB");
        assert_eq!(format_size(9_000_000), "8.6 MB");
        assert_eq!(format_size(1_073_741_824), "1.0 GB");
    }

    #[test]
    #[ignore] // Requires network access
    fn test_live_release_list() {
        let manager = UpdateManager::new(Version::stable(0, 0, 1), UpdateSource::from_settings(&Settings::default()));
        let result = manager.check_for_updates(true);
        assert_ne!(result.status, UpdateStatus::Error, "{}", result.message);
    }
}
