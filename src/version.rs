// ============================================
// Converter - version.rs
// ============================================
// Version strings used by the updater look like:
//
//   2.0.0       stable release
//   2.0.0RC1    release candidate 1
//   2.0.0B2     beta 2
//   2.0.0D1     deepdev 1
//   2.0.0A3     alpha 3
//
// Ordering (highest first) at the same MAJOR.MINOR.PATCH:
//   Stable > RC > Beta > Deepdev > Alpha
// and within one channel the trailing number decides.
// ============================================

use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

// ============================================
// ERRORS
// ============================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// Not three dot-separated components
    #[error("Invalid version string: {0}")]
    Malformed(String),

    /// The letters after PATCH are not a known channel tag
    #[error("Unknown pre-release tag '{tag}' in version string: {version}")]
    UnknownTag { tag: String, version: String },

    /// A numeric field does not fit in a u64
    #[error("Version number out of range in: {0}")]
    OutOfRange(String),
}

// ============================================
// PRE-RELEASE CHANNEL
// ============================================

/// Release channel of a version.
/// The derived ordering is the update priority: Alpha is lowest, Stable highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Alpha,
    Deepdev,
    Beta,
    Rc,
    Stable,
}

impl Channel {
    /// Canonical tag written after PATCH ("" for stable releases)
    pub fn tag(&self) -> &'static str {
        match self {
            Channel::Alpha => "A",
            Channel::Deepdev => "D",
            Channel::Beta => "B",
            Channel::Rc => "RC",
            Channel::Stable => "",
        }
    }

    /// Map a tag (any case, short or long form) to a channel
    pub fn from_tag(tag: &str) -> Option<Channel> {
        match tag.to_ascii_lowercase().as_str() {
            "" | "stable" => Some(Channel::Stable),
            "a" | "alpha" => Some(Channel::Alpha),
            "d" | "deepdev" => Some(Channel::Deepdev),
            "b" | "beta" => Some(Channel::Beta),
            "rc" => Some(Channel::Rc),
            _ => None,
        }
    }

    /// Map the letters between PATCH and the pre-release number. Only an
    /// empty suffix means stable; "stable" is a channel name, not a tag.
    fn from_version_suffix(suffix: &str) -> Option<Channel> {
        if suffix.is_empty() {
            return Some(Channel::Stable);
        }
        Channel::from_tag(suffix).filter(|c| c.is_prerelease())
    }

    pub fn is_prerelease(&self) -> bool {
        *self != Channel::Stable
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Alpha => "alpha",
            Channel::Deepdev => "deepdev",
            Channel::Beta => "beta",
            Channel::Rc => "rc",
            Channel::Stable => "stable",
        };
        f.write_str(name)
    }
}

impl FromStr for Channel {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::from_tag(s.trim()).ok_or_else(|| VersionError::UnknownTag {
            tag: s.to_string(),
            version: s.to_string(),
        })
    }
}

// ============================================
// VERSION
// ============================================

/// A parsed version: (major, minor, patch, channel, pre-release number).
/// Stable versions always carry `pre_number == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub channel: Channel,
    pub pre_number: u64,
}

/// MAJOR.MINOR.PATCH followed by optional letters and an optional number
fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+)\.(\d+)([A-Za-z]*)(\d*)$").expect("version regex is valid")
    })
}

impl Version {
    pub const fn stable(major: u64, minor: u64, patch: u64) -> Self {
        Version {
            major,
            minor,
            patch,
            channel: Channel::Stable,
            pre_number: 0,
        }
    }

    /// Parse a strict version string such as "2.0.0" or "2.0.0B3".
    pub fn parse(input: &str) -> Result<Version, VersionError> {
        let caps = version_pattern()
            .captures(input)
            .ok_or_else(|| VersionError::Malformed(input.to_string()))?;

        let number = |idx: usize| -> Result<u64, VersionError> {
            let text = caps.get(idx).map(|m| m.as_str()).unwrap_or("");
            if text.is_empty() {
                return Ok(0);
            }
            text.parse::<u64>()
                .map_err(|_| VersionError::OutOfRange(input.to_string()))
        };

        let tag = caps.get(4).map(|m| m.as_str()).unwrap_or("");
        let channel = Channel::from_version_suffix(tag).ok_or_else(|| VersionError::UnknownTag {
            tag: tag.to_string(),
            version: input.to_string(),
        })?;

        let pre_number = number(5)?;

        Ok(Version {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            channel,
            // Stable versions have no pre-release number
            pre_number: if channel.is_prerelease() { pre_number } else { 0 },
        })
    }

    /// Parse a GitHub tag name, which may carry a leading "v" or "V".
    pub fn from_tag(tag: &str) -> Result<Version, VersionError> {
        let trimmed = tag.trim();
        let stripped = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        Version::parse(stripped)
    }

    /// The version this binary was built as
    pub fn current() -> Version {
        Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or(Version::stable(0, 0, 0))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| self.channel.cmp(&other.channel))
            .then_with(|| self.pre_number.cmp(&other.pre_number))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.channel.is_prerelease() {
            f.write_str(self.channel.tag())?;
            // A bare tag ("2.0.0B") is written back without a number
            if self.pre_number != 0 {
                write!(f, "{}", self.pre_number)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

// ============================================
// TESTS
// ============================================
