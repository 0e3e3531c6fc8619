//! Liveness and credential probing

use std::time::Duration;

use tracing::debug;

use crate::config::Credentials;
use crate::session::{ConnectError, Connector};

/// Open an authenticated session to `host` and close it again.
///
/// The session is only used to confirm the tag is reachable and accepts the
/// credentials.
///
/// # Errors
/// Returns the reason the session could not be opened within `limit`
pub async fn probe(
    connector: &dyn Connector,
    host: &str,
    credentials: &Credentials,
    limit: Duration,
) -> Result<(), ConnectError> {
    let mut session = match tokio::time::timeout(limit, connector.open(host, credentials)).await {
        Ok(opened) => opened?,
        Err(_) => {
            return Err(ConnectError::TimedOut {
                host: host.to_string(),
                after: limit,
            });
        }
    };

    if let Err(e) = session.close().await {
        debug!("Closing probe session to {host} failed: {e}");
    }
    Ok(())
}

/// [`probe`] collapsed to a boolean
pub async fn is_reachable(
    connector: &dyn Connector,
    host: &str,
    credentials: &Credentials,
    limit: Duration,
) -> bool {
    match probe(connector, host, credentials, limit).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Probe failed: {e}");
            false
        }
    }
}
