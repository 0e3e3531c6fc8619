//! tagsync-transport: how tagsync reaches tags
//!
//! SSH sessions over system `ssh`, LAN scanning and reverse DNS, plus an
//! in-process transport that simulates tags on the local filesystem.

pub mod local;
pub mod scan;
pub mod ssh;

pub use local::{LocalConnector, LocalSession};
pub use scan::{SystemResolver, TcpScanner, local_network};
pub use ssh::{SshConnector, SshSession};
