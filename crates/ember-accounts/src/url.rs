//! Canonical wallet and account locator URLs.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AccountError;

/// Canonical identification URL of a wallet or account.
///
/// A deliberately simplified URL: it contains value-copyable components only
/// and does no encoding or decoding of special characters, so every locator
/// has exactly one canonical text form. The scheme names a capable account
/// backend; the path identifies a unique entity within it. Not meant for use
/// outside wallet and account identification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Url {
    /// Protocol scheme to identify a capable account backend.
    pub scheme: String,
    /// Path for the backend to identify a unique entity.
    pub path: String,
}

impl Url {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self { scheme: scheme.into(), path: path.into() }
    }

    /// Shortened form for terminal and log output.
    pub fn terminal_string(&self) -> String {
        let url = self.to_string();
        if url.chars().count() > 32 {
            let mut short: String = url.chars().take(31).collect();
            short.push('…');
            short
        } else {
            url
        }
    }
}

impl FromStr for Url {
    type Err = AccountError;

    fn from_str(url: &str) -> Result<Self, AccountError> {
        let parts: Vec<&str> = url.split("://").collect();
        if parts.len() != 2 || parts[0].is_empty() {
            return Err(AccountError::MissingScheme);
        }
        Ok(Self { scheme: parts[0].to_string(), path: parts[1].to_string() })
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.is_empty() {
            f.write_str(&self.path)
        } else {
            write!(f, "{}://{}", self.scheme, self.path)
        }
    }
}

/// Total order over locators: scheme first, then path, byte-lexicographic.
impl Ord for Url {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheme
            .cmp(&other.scheme)
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for Url {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
