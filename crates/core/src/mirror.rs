//! Local mirror directories, laid out as `<data-root>/<hostname>/<basename>`

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::hash::ContentDigest;

/// The local copy of one tag's data directory.
///
/// Files are only ever added or replaced here, never deleted.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    /// Mirror for `hostname` under `data_root`, creating the directory if absent
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created
    pub fn ensure(data_root: &Path, hostname: &str) -> io::Result<Self> {
        let root = data_root.join(hostname);
        if !root.is_dir() {
            debug!("Creating local mirror {}", root.display());
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the regular files currently mirrored
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read
    pub fn file_names(&self) -> io::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Local path for a remote file. Only the base name is kept.
    #[must_use]
    pub fn path_for(&self, remote_path: &str) -> PathBuf {
        self.root.join(base_name(remote_path))
    }

    /// Digest of a mirrored file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read to completion
    pub async fn digest(&self, name: &str) -> io::Result<ContentDigest> {
        let path = self.root.join(name);
        tokio::task::spawn_blocking(move || ContentDigest::from_file(&path))
            .await
            .map_err(io::Error::other)?
    }
}

/// Final path component of a remote (always `/`-separated) path
#[must_use]
pub fn base_name(remote_path: &str) -> &str {
    remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote_path)
}
