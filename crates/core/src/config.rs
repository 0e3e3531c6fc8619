//! tagsync configuration file parsing (.tagsync.toml)

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::WrapErr as _;

/// Config file name
pub const CONFIG_FILE: &str = ".tagsync.toml";

/// Login used uniformly for every tag.
///
/// Passed explicitly into every device-facing operation rather than read from
/// a global.
#[derive(Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("pi", "ceticeti")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// tagsync configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TagsyncConfig {
    /// Login for every tag
    pub credentials: Credentials,

    /// Local directory holding one mirror directory per tag
    pub data_root: PathBuf,

    /// Directory on the tag containing `<hostname>/`
    pub remote_root: String,

    /// SSH port
    pub port: u16,

    /// Per-host timeout while scanning the LAN, in milliseconds
    pub scan_timeout_ms: u64,

    /// Maximum number of hosts probed at once while scanning
    pub scan_concurrency: usize,

    /// Timeout for opening an authenticated session, in seconds
    pub connect_timeout_secs: u64,

    /// Timeout for any single remote operation (listing, digest, transfer,
    /// erase), in seconds
    pub operation_timeout_secs: u64,
}

impl Default for TagsyncConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            data_root: PathBuf::from("data"),
            remote_root: "/data".to_string(),
            port: 22,
            scan_timeout_ms: 1000,
            scan_concurrency: 64,
            connect_timeout_secs: 10,
            operation_timeout_secs: 300,
        }
    }
}

impl TagsyncConfig {
    /// Load config from a directory.
    ///
    /// Returns default config if .tagsync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from an explicit file path, which must exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    #[must_use]
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Directory on the tag holding its data files
    #[must_use]
    pub fn remote_dir(&self, hostname: &str) -> String {
        format!("{}/{hostname}", self.remote_root.trim_end_matches('/'))
    }
}
