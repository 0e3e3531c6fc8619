//! Live SSH tests against a real tag
//!
//! These need `ssh` and `sshpass` on PATH and a reachable tag (or any SSH
//! server accepting the configured password). They are ignored by default.
//!
//! Run with:
//! `TAGSYNC_E2E_HOST=wt-abc123def456 cargo test --test ssh_e2e -- --ignored`
//!
//! `TAGSYNC_E2E_USER` and `TAGSYNC_E2E_PASSWORD` override the default login.

use std::time::Duration;

use tagsync_core::{Connector, Credentials, RemoteSession, SessionError};
use tagsync_transport::SshConnector;

fn target() -> Option<(String, Credentials)> {
    let host = std::env::var("TAGSYNC_E2E_HOST").ok()?;
    let defaults = Credentials::default();
    let credentials = Credentials::new(
        std::env::var("TAGSYNC_E2E_USER").unwrap_or(defaults.username),
        std::env::var("TAGSYNC_E2E_PASSWORD").unwrap_or(defaults.password),
    );
    Some((host, credentials))
}

#[tokio::test]
#[ignore = "requires a reachable tag"]
async fn test_session_lists_data_directory() {
    let Some((host, credentials)) = target() else {
        eprintln!("TAGSYNC_E2E_HOST not set, skipping");
        return;
    };

    let connector = SshConnector::new(22, Duration::from_secs(10));
    let mut session = connector.open(&host, &credentials).await.unwrap();

    let output = session.exec("echo tagsync").await.unwrap();
    assert_eq!(output.stdout.trim(), "tagsync");

    match session.list_dir(&format!("/data/{host}")).await {
        Ok(files) => eprintln!("{} files on {host}", files.len()),
        Err(SessionError::CommandFailed { stderr, .. }) => eprintln!("no data directory: {stderr}"),
        Err(e) => panic!("listing failed: {e}"),
    }

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(matches!(session.exec("true").await, Err(SessionError::Closed)));
}

#[tokio::test]
#[ignore = "requires a reachable tag"]
async fn test_wrong_password_is_rejected() {
    let Some((host, credentials)) = target() else {
        eprintln!("TAGSYNC_E2E_HOST not set, skipping");
        return;
    };

    let wrong = Credentials::new(credentials.username, "definitely-not-the-password");
    let connector = SshConnector::new(22, Duration::from_secs(10));
    let err = connector.open(&host, &wrong).await.err().unwrap();
    assert!(
        matches!(err, tagsync_core::ConnectError::AuthRejected { .. }),
        "{err}"
    );
}
