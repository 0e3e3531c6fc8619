//! Transfer planning: which remote files are missing or stale locally
//!
//! A file belongs in the plan iff it is absent from the local mirror, or the
//! mirrored copy's digest differs from the digest the tag reports for it.
//! Remote digests are only requested for files that exist on both sides.

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::mirror::LocalMirror;
use crate::session::{RemoteSession, SessionError};

/// Why a file needs downloading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    /// No local file with this name
    Missing,
    /// Local file exists but its content differs
    Changed,
}

impl fmt::Display for PlanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.pad("missing"),
            Self::Changed => f.pad("changed"),
        }
    }
}

/// One file to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Base name, also the name used in the local mirror
    pub name: String,
    /// Full path on the tag
    pub remote_path: String,
    pub reason: PlanReason,
}

/// Ordered list of files to download from one tag, in remote listing order.
///
/// Always computed fresh; never cached across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    files: Vec<PlannedFile>,
}

impl TransferPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn files(&self) -> &[PlannedFile] {
        &self.files
    }

    /// Remote paths in plan order
    pub fn remote_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.remote_path.as_str())
    }

    /// Base names in plan order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.name.as_str())
    }
}

impl IntoIterator for TransferPlan {
    type Item = PlannedFile;
    type IntoIter = std::vec::IntoIter<PlannedFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

/// Planning failed; no plan could be established
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("remote: {0}")]
    Remote(#[from] SessionError),

    #[error("local mirror: {0}")]
    Local(#[from] std::io::Error),
}

/// Compare a tag's data directory against its local mirror over an open session
///
/// # Errors
/// Returns an error if the remote directory cannot be listed, the session
/// fails, or a mirrored file cannot be read.
pub async fn compute(
    session: &mut dyn RemoteSession,
    mirror: &LocalMirror,
    remote_dir: &str,
) -> Result<TransferPlan, PlanError> {
    let local = mirror.file_names()?;
    let remote = session.list_dir(remote_dir).await?;
    debug!(
        "{} remote files in {remote_dir}, {} mirrored locally",
        remote.len(),
        local.len()
    );

    let mut files = Vec::new();
    for name in remote {
        let remote_path = format!("{}/{name}", remote_dir.trim_end_matches('/'));

        if !local.contains(&name) {
            files.push(PlannedFile {
                name,
                remote_path,
                reason: PlanReason::Missing,
            });
            continue;
        }

        let local_digest = mirror.digest(&name).await?;
        let remote_digest = match session.digest(&remote_path).await {
            Ok(digest) => Some(digest),
            Err(SessionError::CommandFailed { stderr, .. }) => {
                warn!("Could not hash {remote_path} on the tag ({stderr}), scheduling download");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let unchanged = remote_digest
            .as_deref()
            .is_some_and(|digest| local_digest.matches_hex(digest));
        if unchanged {
            debug!("{name} is up to date ({local_digest:?})");
        } else {
            files.push(PlannedFile {
                name,
                remote_path,
                reason: PlanReason::Changed,
            });
        }
    }

    Ok(TransferPlan { files })
}
