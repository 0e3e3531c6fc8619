//! Tag hostnames
//!
//! Every tag announces itself as `wt-` followed by twelve lowercase
//! alphanumerics, e.g. `wt-abc123def456`.

use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^wt-[a-z0-9]{12}$").expect("valid tag pattern"));

/// A hostname known to follow the tag naming scheme
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TagName(String);

impl TagName {
    /// Parse a (possibly fully qualified) hostname.
    ///
    /// Only the first DNS label is considered, so `wt-abc123def456.local`
    /// yields `wt-abc123def456`.
    #[must_use]
    pub fn parse(hostname: &str) -> Option<Self> {
        let short = short_hostname(hostname);
        TAG_PATTERN
            .is_match(short)
            .then(|| Self(short.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TagName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A tag found during discovery. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: TagName,
    pub address: IpAddr,
}

/// Strip any domain suffix from a hostname
#[must_use]
pub fn short_hostname(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// Whether a hostname follows the tag naming scheme
#[must_use]
pub fn is_tag_hostname(hostname: &str) -> bool {
    TagName::parse(hostname).is_some()
}
