//! Download and erase state machine
//!
//! Every device is handled start to finish before the next one: probe, plan,
//! then either download each planned file in its own session or, for erase,
//! refuse unless a freshly computed plan is empty.
//!
//! ```text
//! probe ──fail──> Unreachable
//!   │
//! plan ──fail──> EngineError::Plan
//!   │
//!   ├─ sync:  fetch each file (failures recorded, never abort the batch)
//!   └─ erase: plan empty? ──no──> Refused
//!                 │yes
//!               rm -rf <remote-dir>/*
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempPath;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TagsyncConfig;
use crate::mirror::LocalMirror;
use crate::plan::{self, PlanError, PlannedFile, TransferPlan};
use crate::probe::probe;
use crate::session::{ConnectError, Connector, RemoteSession, SessionError};

/// A device operation that could not proceed
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: ConnectError,
    },

    #[error("could not plan downloads from {host}: {source}")]
    Plan {
        host: String,
        #[source]
        source: PlanError,
    },

    #[error("could not erase {host}: {source}")]
    Erase {
        host: String,
        #[source]
        source: SessionError,
    },

    #[error("could not prepare local mirror for {host}: {source}")]
    Mirror {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether this is a connection or authentication failure
    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// A file that failed to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransfer {
    pub remote_path: String,
    pub reason: String,
}

/// Outcome of syncing one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub host: String,
    /// Number of files the plan contained
    pub planned: usize,
    /// Remote paths downloaded, with their sizes
    pub downloaded: Vec<(String, u64)>,
    pub failed: Vec<FailedTransfer>,
}

impl SyncReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.downloaded.iter().map(|(_, size)| size).sum()
    }
}

/// Outcome of an erase request that reached the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseOutcome {
    /// The remote data directory was emptied
    Erased,
    /// Files are still missing or stale locally; nothing was deleted
    Refused { pending: TransferPlan },
}

/// Per-device results of a batch run, in processing order
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<(String, Result<T, EngineError>)>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }
}

/// Receives progress from the engine. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait SyncObserver: Send + Sync {
    fn connecting(&self, host: &str) {}
    /// A device operation ended in an error (including "could not connect")
    fn failed(&self, host: &str, error: &EngineError) {}
    fn planned(&self, host: &str, plan: &TransferPlan) {}
    fn downloading(&self, host: &str, file: &PlannedFile) {}
    fn downloaded(&self, host: &str, file: &PlannedFile, bytes: u64) {}
    fn download_failed(&self, host: &str, file: &PlannedFile, error: &str) {}
    fn synced(&self, report: &SyncReport) {}
    fn refused(&self, host: &str, pending: &TransferPlan) {}
    fn erasing(&self, host: &str) {}
    fn erased(&self, host: &str) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

enum Interrupt {
    TimedOut(Duration),
    Cancelled,
}

/// Drives sync and erase for individual devices and batches
pub struct SyncEngine {
    connector: Arc<dyn Connector>,
    config: TagsyncConfig,
    observer: Arc<dyn SyncObserver>,
    cancel: CancellationToken,
}

impl SyncEngine {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: TagsyncConfig) -> Self {
        Self {
            connector,
            config,
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use `token` to stop the engine. Cancellation interrupts the operation in
    /// flight and prevents any further device or file from being started.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn config(&self) -> &TagsyncConfig {
        &self.config
    }

    /// Run `fut` bounded by `limit` and the cancellation token
    async fn bounded<F: Future>(&self, limit: Duration, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            result = tokio::time::timeout(limit, fut) => result.map_err(|_| Interrupt::TimedOut(limit)),
        }
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn open(&self, host: &str) -> Result<Box<dyn RemoteSession>, EngineError> {
        let limit = self.config.connect_timeout();
        match self
            .bounded(limit, self.connector.open(host, &self.config.credentials))
            .await
        {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(source)) => Err(EngineError::Connect {
                host: host.to_string(),
                source,
            }),
            Err(Interrupt::TimedOut(after)) => Err(EngineError::Connect {
                host: host.to_string(),
                source: ConnectError::TimedOut {
                    host: host.to_string(),
                    after,
                },
            }),
            Err(Interrupt::Cancelled) => Err(EngineError::Cancelled),
        }
    }

    /// Close a session, logging rather than failing on errors
    async fn close(&self, host: &str, mut session: Box<dyn RemoteSession>) {
        let limit = self.config.connect_timeout();
        match tokio::time::timeout(limit, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing session to {host} failed: {e}"),
            Err(_) => debug!("Closing session to {host} timed out"),
        }
    }

    /// Probe gate shared by sync and erase
    async fn gate(&self, host: &str) -> Result<(), EngineError> {
        self.check_cancelled()?;
        self.observer.connecting(host);
        let probed = self
            .bounded(
                self.config.connect_timeout(),
                probe(
                    self.connector.as_ref(),
                    host,
                    &self.config.credentials,
                    self.config.connect_timeout(),
                ),
            )
            .await;
        let source = match probed {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(source)) => source,
            Err(Interrupt::TimedOut(after)) => ConnectError::TimedOut {
                host: host.to_string(),
                after,
            },
            Err(Interrupt::Cancelled) => return Err(EngineError::Cancelled),
        };
        Err(EngineError::Connect {
            host: host.to_string(),
            source,
        })
    }

    /// Compute a fresh transfer plan for `host`.
    ///
    /// # Errors
    /// Fails if no session can be opened or the comparison cannot complete;
    /// never reports an empty plan in that case.
    pub async fn plan(&self, host: &str) -> Result<TransferPlan, EngineError> {
        let mut session = self.open(host).await?;

        let mirror = match LocalMirror::ensure(&self.config.data_root, host) {
            Ok(mirror) => mirror,
            Err(source) => {
                self.close(host, session).await;
                return Err(EngineError::Mirror {
                    host: host.to_string(),
                    source,
                });
            }
        };

        let remote_dir = self.config.remote_dir(host);
        let computed = self
            .bounded(
                self.config.operation_timeout(),
                plan::compute(session.as_mut(), &mirror, &remote_dir),
            )
            .await;
        self.close(host, session).await;

        match computed {
            Ok(Ok(plan)) => {
                debug!("Plan for {host}: {} files", plan.len());
                Ok(plan)
            }
            Ok(Err(source)) => Err(EngineError::Plan {
                host: host.to_string(),
                source,
            }),
            Err(Interrupt::TimedOut(after)) => Err(EngineError::Plan {
                host: host.to_string(),
                source: PlanError::Remote(SessionError::TimedOut(after)),
            }),
            Err(Interrupt::Cancelled) => Err(EngineError::Cancelled),
        }
    }

    /// Download every missing or changed file from `host`.
    ///
    /// Re-running is safe: files already mirrored with matching content are
    /// not planned again. A failed file is recorded and the rest of the plan
    /// still runs; completed files are never rolled back.
    ///
    /// # Errors
    /// Fails if the device cannot be reached, no plan can be computed, or the
    /// run is cancelled.
    pub async fn sync_device(&self, host: &str) -> Result<SyncReport, EngineError> {
        let result = self.run_sync(host).await;
        if let Err(e) = &result {
            self.observer.failed(host, e);
        }
        result
    }

    async fn run_sync(&self, host: &str) -> Result<SyncReport, EngineError> {
        self.gate(host).await?;
        debug!("Connected to {host}");

        let plan = self.plan(host).await?;
        self.observer.planned(host, &plan);

        let mirror = LocalMirror::ensure(&self.config.data_root, host).map_err(|source| {
            EngineError::Mirror {
                host: host.to_string(),
                source,
            }
        })?;

        let mut report = SyncReport {
            host: host.to_string(),
            planned: plan.len(),
            ..SyncReport::default()
        };

        for file in plan {
            self.check_cancelled()?;
            self.observer.downloading(host, &file);
            match self.download(host, &mirror, &file).await {
                Ok(bytes) => {
                    self.observer.downloaded(host, &file, bytes);
                    report.downloaded.push((file.remote_path, bytes));
                }
                Err(DownloadError::Cancelled) => return Err(EngineError::Cancelled),
                Err(DownloadError::Failed(reason)) => {
                    debug!("Download of {} failed: {reason}", file.remote_path);
                    self.observer.download_failed(host, &file, &reason);
                    report.failed.push(FailedTransfer {
                        remote_path: file.remote_path,
                        reason,
                    });
                }
            }
        }

        debug!(
            "Done downloading from {host}: {} of {} files",
            report.downloaded.len(),
            report.planned
        );
        self.observer.synced(&report);
        Ok(report)
    }

    /// Fetch one file in its own session.
    ///
    /// Bytes land in a hidden temporary file next to the mirrored copy and
    /// replace it only after the transfer completes. Tags never list dotfiles,
    /// so the temporary name cannot shadow a mirrored file.
    async fn download(
        &self,
        host: &str,
        mirror: &LocalMirror,
        file: &PlannedFile,
    ) -> Result<u64, DownloadError> {
        let mut session = match self.open(host).await {
            Ok(session) => session,
            Err(EngineError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(e) => return Err(DownloadError::Failed(e.to_string())),
        };

        // Removed on drop unless persisted
        let partial = match partial_file(mirror.root()) {
            Ok(partial) => partial,
            Err(e) => {
                self.close(host, session).await;
                return Err(DownloadError::Failed(format!("creating temporary file: {e}")));
            }
        };
        let fetched = self
            .bounded(
                self.config.operation_timeout(),
                session.fetch(&file.remote_path, &partial),
            )
            .await;
        self.close(host, session).await;

        match fetched {
            Ok(Ok(bytes)) => partial
                .persist(mirror.path_for(&file.remote_path))
                .map(|()| bytes)
                .map_err(|e| DownloadError::Failed(format!("moving into place: {e}"))),
            Ok(Err(e)) => Err(DownloadError::Failed(e.to_string())),
            Err(Interrupt::TimedOut(after)) => Err(DownloadError::Failed(
                SessionError::TimedOut(after).to_string(),
            )),
            Err(Interrupt::Cancelled) => Err(DownloadError::Cancelled),
        }
    }

    /// Wipe `host`'s data directory, but only once everything on it is
    /// mirrored locally.
    ///
    /// The plan is always recomputed here; a plan from an earlier sync is never
    /// trusted because files may have appeared or changed since.
    ///
    /// # Errors
    /// Fails if the device cannot be reached, no plan can be computed, the
    /// removal fails, or the run is cancelled. A non-empty plan is not an
    /// error but [`EraseOutcome::Refused`].
    pub async fn erase_device(&self, host: &str) -> Result<EraseOutcome, EngineError> {
        let result = self.run_erase(host).await;
        if let Err(e) = &result {
            self.observer.failed(host, e);
        }
        result
    }

    async fn run_erase(&self, host: &str) -> Result<EraseOutcome, EngineError> {
        self.gate(host).await?;

        let pending = self.plan(host).await?;
        if !pending.is_empty() {
            debug!(
                "Not all data have been downloaded from {host} ({} files pending), refusing to erase",
                pending.len()
            );
            self.observer.refused(host, &pending);
            return Ok(EraseOutcome::Refused { pending });
        }

        self.check_cancelled()?;
        self.observer.erasing(host);
        debug!("Erasing all collected data from tag {host}");

        let mut session = self.open(host).await?;
        let remote_dir = self.config.remote_dir(host);
        let removed = self
            .bounded(
                self.config.operation_timeout(),
                session.remove_contents(&remote_dir),
            )
            .await;
        self.close(host, session).await;

        match removed {
            Ok(Ok(())) => {
                self.observer.erased(host);
                Ok(EraseOutcome::Erased)
            }
            Ok(Err(source)) => Err(EngineError::Erase {
                host: host.to_string(),
                source,
            }),
            Err(Interrupt::TimedOut(after)) => Err(EngineError::Erase {
                host: host.to_string(),
                source: SessionError::TimedOut(after),
            }),
            Err(Interrupt::Cancelled) => Err(EngineError::Cancelled),
        }
    }

    /// Sync each host in turn. A failing host never stops the rest; only
    /// cancellation ends the batch early.
    pub async fn sync_all<S: AsRef<str>>(&self, hosts: &[S]) -> BatchReport<SyncReport> {
        let mut batch = BatchReport::default();
        for host in hosts {
            let host = host.as_ref();
            let result = self.sync_device(host).await;
            let cancelled = matches!(result, Err(EngineError::Cancelled));
            if let Err(e) = &result {
                debug!("{host}: {e}");
            }
            batch.results.push((host.to_string(), result));
            if cancelled {
                break;
            }
        }
        batch
    }

    /// Erase each host in turn, with the same guard as [`Self::erase_device`]
    pub async fn erase_all<S: AsRef<str>>(&self, hosts: &[S]) -> BatchReport<EraseOutcome> {
        let mut batch = BatchReport::default();
        for host in hosts {
            let host = host.as_ref();
            let result = self.erase_device(host).await;
            let cancelled = matches!(result, Err(EngineError::Cancelled));
            if let Err(e) = &result {
                debug!("{host}: {e}");
            }
            batch.results.push((host.to_string(), result));
            if cancelled {
                break;
            }
        }
        batch
    }
}

enum DownloadError {
    Failed(String),
    Cancelled,
}

fn partial_file(dir: &Path) -> std::io::Result<TempPath> {
    Ok(tempfile::Builder::new()
        .prefix(".tagsync-")
        .suffix(".part")
        .tempfile_in(dir)?
        .into_temp_path())
}
