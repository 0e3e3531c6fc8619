//! Local in-process transport for testing
//!
//! This module provides a `LocalConnector` that simulates tags on the local
//! filesystem, without SSH. Each simulated tag has its own filesystem root at
//! `<root>/<hostname>/`, so the tag path `/data/<hostname>/a.bin` lives at
//! `<root>/<hostname>/data/<hostname>/a.bin`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use color_eyre::Result;
use tagsync_core::{
    CommandOutput, ConnectError, Connector, ContentDigest, Credentials, RemoteSession,
    SessionError,
};

#[derive(Debug, Default)]
struct Faults {
    offline: HashSet<String>,
    failing_fetches: HashSet<String>,
}

#[derive(Debug, Default)]
struct SessionCounts {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Simulated tags backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
    remote_root: String,
    credentials: Credentials,
    faults: Arc<Mutex<Faults>>,
    removals: Arc<Mutex<Vec<String>>>,
    counts: Arc<SessionCounts>,
}

impl LocalConnector {
    /// Create a connector whose tags live under `root` and accept `credentials`
    pub fn new(root: impl Into<PathBuf>, credentials: Credentials) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            remote_root: "/data".to_string(),
            credentials,
            faults: Arc::default(),
            removals: Arc::default(),
            counts: Arc::default(),
        })
    }

    /// Filesystem root of a simulated tag
    #[must_use]
    pub fn device_root(&self, host: &str) -> PathBuf {
        self.root.join(host)
    }

    /// Local directory standing in for the tag's `/data/<host>/`
    #[must_use]
    pub fn data_dir(&self, host: &str) -> PathBuf {
        self.device_root(host)
            .join(self.remote_root.trim_start_matches('/'))
            .join(host)
    }

    /// Create a tag with an empty data directory
    pub fn add_device(&self, host: &str) -> Result<()> {
        std::fs::create_dir_all(self.data_dir(host))?;
        Ok(())
    }

    /// Write a data file on a tag, creating the tag if needed
    pub fn put_file(&self, host: &str, name: &str, data: &[u8]) -> Result<()> {
        let dir = self.data_dir(host);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(name), data)?;
        Ok(())
    }

    /// Make a tag refuse connections (or accept them again)
    pub fn set_offline(&self, host: &str, offline: bool) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        if offline {
            faults.offline.insert(host.to_string());
        } else {
            faults.offline.remove(host);
        }
    }

    /// Make fetches of one remote path fail
    pub fn fail_fetch(&self, remote_path: &str) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_fetches
            .insert(remote_path.to_string());
    }

    /// Sessions successfully opened so far
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.counts.opened.load(Ordering::SeqCst)
    }

    /// Sessions closed so far (repeat closes of one session count once)
    #[must_use]
    pub fn sessions_closed(&self) -> usize {
        self.counts.closed.load(Ordering::SeqCst)
    }

    /// Remote directories whose contents were removed, in order
    #[must_use]
    pub fn removals(&self) -> Vec<String> {
        self.removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn open(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, ConnectError> {
        let root = self.device_root(host);
        let offline = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offline
            .contains(host);
        if offline || !root.is_dir() {
            return Err(ConnectError::Unreachable {
                host: host.to_string(),
                reason: "no such simulated tag".to_string(),
            });
        }
        if credentials != &self.credentials {
            return Err(ConnectError::AuthRejected {
                host: host.to_string(),
                user: credentials.username.clone(),
            });
        }

        self.counts.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalSession {
            root,
            faults: Arc::clone(&self.faults),
            removals: Arc::clone(&self.removals),
            counts: Arc::clone(&self.counts),
            closed: false,
        }))
    }
}

/// Session against one simulated tag
pub struct LocalSession {
    root: PathBuf,
    faults: Arc<Mutex<Faults>>,
    removals: Arc<Mutex<Vec<String>>>,
    counts: Arc<SessionCounts>,
    closed: bool,
}

impl LocalSession {
    fn resolve(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn failed(command: String, status: i32, err: &std::io::Error) -> SessionError {
        SessionError::CommandFailed {
            command,
            status,
            stderr: err.to_string(),
        }
    }
}

/// Names `ls -1` would print: non-hidden entries, sorted
fn visible_entries(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        self.ensure_open()?;
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    async fn list_dir(&mut self, dir: &str) -> Result<Vec<String>, SessionError> {
        self.ensure_open()?;
        visible_entries(&self.resolve(dir)).map_err(|e| Self::failed(format!("ls -1 -- {dir}"), 2, &e))
    }

    async fn digest(&mut self, path: &str) -> Result<String, SessionError> {
        self.ensure_open()?;
        ContentDigest::from_file(&self.resolve(path))
            .map(|d| d.to_hex())
            .map_err(|e| Self::failed(format!("sha256sum -- {path}"), 1, &e))
    }

    async fn fetch(&mut self, remote: &str, local: &Path) -> Result<u64, SessionError> {
        self.ensure_open()?;
        let failing = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_fetches
            .contains(remote);
        if failing {
            return Err(SessionError::CommandFailed {
                command: format!("cat -- {remote}"),
                status: 1,
                stderr: "simulated transfer failure".to_string(),
            });
        }

        tokio::fs::copy(self.resolve(remote), local)
            .await
            .map_err(|e| Self::failed(format!("cat -- {remote}"), 1, &e))
    }

    async fn remove_contents(&mut self, dir: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dir.to_string());

        let full = self.resolve(dir);
        let Ok(names) = visible_entries(&full) else {
            // `rm -rf dir/*` with nothing to match succeeds
            return Ok(());
        };
        for name in names {
            let path = full.join(name);
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.counts.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
