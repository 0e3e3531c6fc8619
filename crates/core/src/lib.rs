//! tagsync-core: sync-and-verify engine
//!
//! Discovers tags, plans downloads by content digest, drives the download and
//! erase state machine, and guards remote deletion behind a fresh plan.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod hash;
pub mod mirror;
pub mod plan;
pub mod probe;
pub mod session;
pub mod tag;

pub use config::{Credentials, TagsyncConfig};
pub use discovery::{Discovery, DiscoveryOptions, HostResolver, HostScanner, NetworkRange};
pub use engine::{
    BatchReport, EngineError, EraseOutcome, FailedTransfer, NoopObserver, SyncEngine,
    SyncObserver, SyncReport,
};
pub use hash::ContentDigest;
pub use mirror::LocalMirror;
pub use plan::{PlanError, PlanReason, PlannedFile, TransferPlan};
pub use probe::{is_reachable, probe};
pub use session::{CommandOutput, ConnectError, Connector, RemoteSession, SessionError};
pub use tag::{Device, TagName};
