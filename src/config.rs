// ============================================
// Converter - config.rs
// ============================================
// User settings and the fixed directory layout under ~/.converter
//
//   ~/.converter/
//   ├── config.toml           # user settings (this module)
//   ├── log/
//   │   └── converter.log     # written when --log-file is used
//   └── update/
//       ├── state.json        # version tracking + pending temp dir
//       └── com/
//           └── update_apply.command
//
// Every setting has a default, so a missing config.toml simply means
// "use the defaults". Environment variables override the file for the
// GitHub token so it never has to be written to disk.
// ============================================

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::version::Channel;

/// Name of the hidden per-user data directory
const DATA_DIR_NAME: &str = ".converter";

/// Environment variable that points at an alternative config file
pub const CONFIG_PATH_ENV: &str = "CONVERTER_CONFIG";

/// Environment variables checked (in order) for a GitHub token
const TOKEN_ENV_VARS: [&str; 2] = ["CONVERTER_GITHUB_TOKEN", "GITHUB_TOKEN"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not determine the home directory")]
    NoHome,
}

// ============================================
// SETTINGS
// ============================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub update: UpdateSettings,
    pub network: NetworkSettings,
    pub log: LogSettings,
}

/// Where updates come from and how they are filtered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// GitHub repository owner, e.g. "pyquick"
    pub owner: String,

    /// GitHub repository name, e.g. "Converter"
    pub repo: String,

    /// Consider releases GitHub marks as pre-releases
    pub include_prerelease: bool,

    /// Lowest channel accepted when pre-releases are included
    /// ("alpha", "deepdev", "beta", "rc" or "stable")
    pub channel: String,

    /// GitHub personal access token (empty = anonymous, rate limited)
    pub token: String,

    /// API root, overridable for GitHub Enterprise or tests
    pub api_base: String,

    /// Where staged updates are copied to (empty = platform default)
    pub install_dir: String,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            owner: "pyquick".to_string(),
            repo: "Converter".to_string(),
            include_prerelease: false,
            channel: "alpha".to_string(),
            token: String::new(),
            api_base: "https://api.github.com".to_string(),
            install_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Timeout for update downloads
    pub timeout_secs: u64,

    /// Timeout for the release list API call
    pub check_timeout_secs: u64,

    /// How many times a download request is attempted
    pub retry_attempts: u32,

    /// Fixed delay between attempts (no jitter)
    pub retry_delay_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            timeout_secs: 30,
            check_timeout_secs: 10,
            retry_attempts: 3,
            retry_delay_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default level when RUST_LOG is not set
    pub level: String,

    /// Mirror the log into ~/.converter/log/converter.log
    pub to_file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: "info".to_string(),
            to_file: false,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    /// A missing file is not an error: defaults are returned.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(p) => PathBuf::from(p),
                None => Paths::discover()?.config_file(),
            },
        };

        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let settings = Settings::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Settings, toml::de::Error> {
        toml::from_str(text)
    }

    /// Token from the environment first, then from the file
    pub fn github_token(&self) -> Option<String> {
        TOKEN_ENV_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .chain(std::iter::once(self.update.token.clone()))
            .map(|t| t.trim().to_string())
            .find(|t| !t.is_empty())
    }

    /// Lowest accepted channel; unknown names fall back to accepting everything
    pub fn lowest_channel(&self) -> Channel {
        Channel::from_tag(&self.update.channel).unwrap_or_else(|| {
            log::warn!(
                "Unknown update channel '{}' in config, accepting all channels",
                self.update.channel
            );
            Channel::Alpha
        })
    }

    /// Directory a staged update is installed into
    pub fn install_dir(&self) -> PathBuf {
        if !self.update.install_dir.trim().is_empty() {
            return PathBuf::from(self.update.install_dir.trim());
        }
        if cfg!(target_os = "macos") {
            PathBuf::from("/Applications")
        } else {
            crate::tools::get_app_directory()
        }
    }
}

// ============================================
// PATHS
// ============================================

/// The ~/.converter directory layout.
/// Tests build one rooted in a temp directory with `Paths::with_root`.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// ~/.converter for the current user
    pub fn discover() -> Result<Paths, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        Ok(Paths::with_root(home.join(DATA_DIR_NAME)))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Paths {
        Paths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("converter.log")
    }

    pub fn update_dir(&self) -> PathBuf {
        self.root.join("update")
    }

    /// Where update_apply.command is written
    pub fn staging_dir(&self) -> PathBuf {
        self.update_dir().join("com")
    }

    pub fn update_state_file(&self) -> PathBuf {
        self.update_dir().join("state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.update.owner, "pyquick");
        assert_eq!(settings.update.repo, "Converter");
        assert!(!settings.update.include_prerelease);
        assert_eq!(settings.network.retry_attempts, 3);
        assert_eq!(settings.network.retry_delay_secs, 2);
        assert_eq!(settings.network.check_timeout_secs, 10);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
[update]
include_prerelease = true
channel = "beta"

[network]
retry_attempts = 5
"#,
        )
        .unwrap();

        assert!(settings.update.include_prerelease);
        assert_eq!(settings.lowest_channel(), Channel::Beta);
        assert_eq!(settings.update.repo, "Converter");
        assert_eq!(settings.network.retry_attempts, 5);
        assert_eq!(settings.network.timeout_secs, 30);
    }

    #[test]
    fn test_unknown_channel_accepts_everything() {
        let mut settings = Settings::default();
        settings.update.channel = "nightly".to_string();
        assert_eq!(settings.lowest_channel(), Channel::Alpha);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(settings.update.api_base, "https://api.github.com");
    }

    #[test]
    fn test_load_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[update\nowner = ").unwrap();
        assert!(matches!(
            Settings::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_configured_install_dir_wins() {
        let mut settings = Settings::default();
        settings.update.install_dir = "/opt/converter".to_string();
        assert_eq!(settings.install_dir(), PathBuf::from("/opt/converter"));
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::with_root("/home/u/.converter");
        assert_eq!(
            paths.staging_dir(),
            PathBuf::from("/home/u/.converter/update/com")
        );
        assert_eq!(paths.log_dir(), PathBuf::from("/home/u/.converter/log"));
        assert_eq!(
            paths.update_state_file(),
            PathBuf::from("/home/u/.converter/update/state.json")
        );
    }
}
