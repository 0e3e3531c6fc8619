//! LAN scanning: local network detection, TCP port sweep, reverse DNS

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use local_ip_address::list_afinet_netifas;
use tagsync_core::{HostResolver, HostScanner, NetworkRange};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Detect the LAN this machine is on: the /24 around its first private,
/// non-loopback IPv4 interface address.
///
/// # Errors
/// Returns an error if interfaces cannot be listed or none qualifies
pub fn local_network() -> Result<NetworkRange> {
    let interfaces = list_afinet_netifas()
        .map_err(|e| color_eyre::eyre::eyre!("failed to enumerate network interfaces: {e}"))?;

    for (iface_name, ip) in interfaces {
        if let IpAddr::V4(v4) = ip {
            if v4.is_loopback() || v4.is_link_local() || is_tunnel_interface(&iface_name) {
                continue;
            }
            if v4.is_private() {
                info!(ip = %v4, interface = %iface_name, "detected LAN address");
                return Ok(NetworkRange::from_interface(v4));
            }
        }
    }

    warn!("no private IPv4 interface found");
    Err(color_eyre::eyre::eyre!(
        "no private IPv4 network interface found; is this machine on the tag network?"
    ))
}

fn is_tunnel_interface(name: &str) -> bool {
    name.contains("utun") || name.contains("tun") || name.contains("tap")
}

/// Concurrent TCP connect scanner
#[derive(Debug, Clone)]
pub struct TcpScanner {
    concurrency: usize,
}

impl TcpScanner {
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

impl Default for TcpScanner {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl HostScanner for TcpScanner {
    async fn scan(&self, range: &NetworkRange, port: u16, per_host: Duration) -> Vec<IpAddr> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for addr in range.hosts() {
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                port_open(addr, port, per_host).await.then_some(IpAddr::V4(addr))
            });
        }

        let mut open = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(addr)) => open.push(addr),
                Ok(None) => {}
                Err(e) => debug!("scan task failed: {e}"),
            }
        }
        open.sort();
        open
    }
}

async fn port_open(addr: Ipv4Addr, port: u16, per_host: Duration) -> bool {
    matches!(
        tokio::time::timeout(per_host, TcpStream::connect((addr, port))).await,
        Ok(Ok(_))
    )
}

/// Reverse lookups through the system resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn reverse(&self, addr: IpAddr) -> Option<String> {
        match tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr)).await {
            Ok(Ok(name)) if name != addr.to_string() => Some(name),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                debug!("reverse lookup of {addr} failed: {e}");
                None
            }
            Err(e) => {
                debug!("reverse lookup task failed: {e}");
                None
            }
        }
    }
}
