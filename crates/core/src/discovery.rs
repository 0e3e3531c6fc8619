//! LAN discovery of tags
//!
//! Scan the local /24 for an open SSH port, reverse-resolve every responder,
//! keep the names that follow the tag scheme and confirm each one with a
//! probe. Only the scan itself runs concurrently; probing is sequential.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{Credentials, TagsyncConfig};
use crate::probe::probe;
use crate::session::Connector;
use crate::tag::{Device, TagName};

/// An IPv4 network to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkRange {
    network: Ipv4Addr,
    prefix: u8,
}

impl NetworkRange {
    /// Network of `prefix` bits containing `addr`
    #[must_use]
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        let prefix = prefix.min(32);
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        }
    }

    /// The /24 around a host's own interface address
    #[must_use]
    pub fn from_interface(addr: Ipv4Addr) -> Self {
        Self::new(addr, 24)
    }

    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Host addresses, excluding the network and broadcast addresses when the
    /// prefix leaves room for them
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let base = u32::from(self.network);
        let size = 1u64 << (32 - u32::from(self.prefix));
        let (first, last) = if size > 2 {
            (1, size - 2)
        } else {
            (0, size - 1)
        };
        (first..=last).map(move |offset| Ipv4Addr::from(base + offset as u32))
    }
}

impl std::fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Finds hosts with a given TCP port open
#[async_trait]
pub trait HostScanner: Send + Sync {
    async fn scan(&self, range: &NetworkRange, port: u16, per_host: Duration) -> Vec<IpAddr>;
}

/// Reverse name lookup
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Hostname for `addr`, or `None` if it does not resolve
    async fn reverse(&self, addr: IpAddr) -> Option<String>;
}

/// Discovery settings taken from the config
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub port: u16,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub credentials: Credentials,
}

impl From<&TagsyncConfig> for DiscoveryOptions {
    fn from(config: &TagsyncConfig) -> Self {
        Self {
            port: config.port,
            scan_timeout: config.scan_timeout(),
            connect_timeout: config.connect_timeout(),
            credentials: config.credentials.clone(),
        }
    }
}

/// Discovers tags reachable on the LAN
pub struct Discovery<'a> {
    pub scanner: &'a dyn HostScanner,
    pub resolver: &'a dyn HostResolver,
    pub connector: &'a dyn Connector,
    pub options: DiscoveryOptions,
}

impl Discovery<'_> {
    /// Confirmed tags in `range`, sorted and de-duplicated by name.
    ///
    /// Scan order carries no meaning; addresses that do not resolve or do not
    /// follow the tag naming scheme are dropped silently.
    pub async fn discover(&self, range: &NetworkRange) -> Vec<Device> {
        debug!("Scanning {range} for SSH on port {}", self.options.port);
        let addrs = self
            .scanner
            .scan(range, self.options.port, self.options.scan_timeout)
            .await;
        debug!("{} hosts answered on port {}", addrs.len(), self.options.port);

        let mut candidates: BTreeMap<TagName, IpAddr> = BTreeMap::new();
        for addr in addrs {
            let Some(hostname) = self.resolver.reverse(addr).await else {
                debug!("{addr} has no reverse name, skipping");
                continue;
            };
            match TagName::parse(&hostname) {
                Some(name) => {
                    candidates.entry(name).or_insert(addr);
                }
                None => debug!("{hostname} ({addr}) is not a tag"),
            }
        }

        let mut devices = Vec::with_capacity(candidates.len());
        for (name, address) in candidates {
            match probe(
                self.connector,
                name.as_str(),
                &self.options.credentials,
                self.options.connect_timeout,
            )
            .await
            {
                Ok(()) => devices.push(Device { name, address }),
                Err(e) => info!("Ignoring {name}: {e}"),
            }
        }
        devices
    }
}
