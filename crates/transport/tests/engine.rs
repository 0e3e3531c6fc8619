//! End-to-end engine tests against simulated tags
//!
//! Every tag here is a directory driven through `LocalConnector`, so the full
//! probe/plan/download/erase flow runs without SSH.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tagsync_core::{
    ConnectError, ContentDigest, Credentials, Discovery, DiscoveryOptions, EngineError,
    EraseOutcome, HostResolver, HostScanner, NetworkRange, PlanReason, PlannedFile, SyncEngine,
    SyncObserver, SyncReport, TagsyncConfig, TransferPlan,
};
use tagsync_transport::LocalConnector;
use tokio_util::sync::CancellationToken;

const TAG: &str = "wt-abc123def456";

struct Fixture {
    _dir: tempfile::TempDir,
    connector: LocalConnector,
    config: TagsyncConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let connector =
            LocalConnector::new(dir.path().join("tags"), Credentials::default()).unwrap();
        let config = TagsyncConfig {
            data_root: dir.path().join("mirror"),
            connect_timeout_secs: 5,
            operation_timeout_secs: 5,
            ..TagsyncConfig::default()
        };
        Self {
            _dir: dir,
            connector,
            config,
        }
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::new(Arc::new(self.connector.clone()), self.config.clone())
    }

    fn mirror_path(&self, host: &str, name: &str) -> PathBuf {
        self.config.data_root.join(host).join(name)
    }

    fn put_local(&self, host: &str, name: &str, data: &[u8]) {
        let path = self.mirror_path(host, name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }
}

/// Every entry in a local mirror directory, hidden ones included
fn mirror_entries(fx: &Fixture, host: &str) -> Vec<String> {
    let mut entries: Vec<String> = std::fs::read_dir(fx.config.data_root.join(host))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    entries.sort();
    entries
}

fn names(plan: &TransferPlan) -> Vec<&str> {
    plan.names().collect()
}

#[tokio::test]
async fn missing_file_is_planned_then_synced() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"alpha").unwrap();
    fx.connector.put_file(TAG, "b.bin", b"bravo").unwrap();
    fx.put_local(TAG, "a.bin", b"alpha");
    let engine = fx.engine();

    let plan = engine.plan(TAG).await.unwrap();
    assert_eq!(names(&plan), vec!["b.bin"]);
    assert_eq!(
        plan.remote_paths().collect::<Vec<_>>(),
        vec![format!("/data/{TAG}/b.bin")]
    );

    let report = engine.sync_device(TAG).await.unwrap();
    assert_eq!(report.planned, 1);
    assert_eq!(report.downloaded, vec![(format!("/data/{TAG}/b.bin"), 5)]);
    assert!(report.is_complete());
    assert_eq!(std::fs::read(fx.mirror_path(TAG, "b.bin")).unwrap(), b"bravo");

    assert!(engine.plan(TAG).await.unwrap().is_empty());
}

#[tokio::test]
async fn changed_file_is_redownloaded() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"fresh data").unwrap();
    fx.put_local(TAG, "a.bin", b"stale data");
    let engine = fx.engine();

    let plan = engine.plan(TAG).await.unwrap();
    assert_eq!(names(&plan), vec!["a.bin"]);
    assert_eq!(plan.files()[0].reason, PlanReason::Changed);

    engine.sync_device(TAG).await.unwrap();
    let local = ContentDigest::from_file(&fx.mirror_path(TAG, "a.bin")).unwrap();
    assert_eq!(local, ContentDigest::from_bytes(b"fresh data"));
    assert!(engine.plan(TAG).await.unwrap().is_empty());
}

#[tokio::test]
async fn identical_files_are_never_planned() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "same.bin", b"identical").unwrap();
    fx.put_local(TAG, "same.bin", b"identical");

    assert!(fx.engine().plan(TAG).await.unwrap().is_empty());
}

#[tokio::test]
async fn planning_is_idempotent() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.connector.put_file(TAG, "b.bin", b"b").unwrap();
    fx.connector.put_file(TAG, "c.bin", b"c").unwrap();
    fx.put_local(TAG, "b.bin", b"b");
    fx.put_local(TAG, "c.bin", b"not c");
    let engine = fx.engine();

    let first = engine.plan(TAG).await.unwrap();
    let second = engine.plan(TAG).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(names(&first), vec!["a.bin", "c.bin"]);
}

#[tokio::test]
async fn first_contact_creates_mirror() {
    let fx = Fixture::new();
    fx.connector.add_device(TAG).unwrap();

    assert!(fx.engine().plan(TAG).await.unwrap().is_empty());
    assert!(fx.config.data_root.join(TAG).is_dir());
}

#[tokio::test]
async fn planning_an_unreachable_tag_is_an_error() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.connector.set_offline(TAG, true);

    let err = fx.engine().plan(TAG).await.unwrap_err();
    assert!(err.is_connect(), "{err}");
}

#[tokio::test]
async fn missing_remote_directory_fails_planning() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.connector.device_root(TAG)).unwrap();

    let err = fx.engine().plan(TAG).await.unwrap_err();
    assert!(matches!(err, EngineError::Plan { .. }), "{err}");
    assert_eq!(fx.connector.sessions_opened(), 1);
    assert_eq!(fx.connector.sessions_closed(), 1);
}

#[tokio::test]
async fn planning_closes_its_session() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.put_local(TAG, "a.bin", b"a");

    assert!(fx.engine().plan(TAG).await.unwrap().is_empty());
    assert_eq!(fx.connector.sessions_opened(), 1);
    assert_eq!(fx.connector.sessions_closed(), 1);
}

#[tokio::test]
async fn failed_transfer_does_not_abort_plan() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.connector.put_file(TAG, "b.bin", b"b").unwrap();
    fx.connector.fail_fetch(&format!("/data/{TAG}/a.bin"));
    let engine = fx.engine();

    let report = engine.sync_device(TAG).await.unwrap();
    assert_eq!(report.planned, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].remote_path, format!("/data/{TAG}/a.bin"));
    assert_eq!(report.downloaded.len(), 1);
    assert!(!fx.mirror_path(TAG, "a.bin").exists());
    assert_eq!(mirror_entries(&fx, TAG), vec!["b.bin"]);

    // Probe, plan, then one session per planned file, all closed
    assert_eq!(fx.connector.sessions_opened(), 2 + report.planned);
    assert_eq!(fx.connector.sessions_closed(), fx.connector.sessions_opened());

    // The failed file stays in the next plan until it succeeds
    assert_eq!(names(&engine.plan(TAG).await.unwrap()), vec!["a.bin"]);
}

#[tokio::test]
async fn failed_redownload_keeps_existing_copy() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"new").unwrap();
    fx.put_local(TAG, "a.bin", b"old");
    fx.connector.fail_fetch(&format!("/data/{TAG}/a.bin"));

    let report = fx.engine().sync_device(TAG).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(std::fs::read(fx.mirror_path(TAG, "a.bin")).unwrap(), b"old");
}

#[tokio::test]
async fn failed_download_leaves_similarly_named_files_alone() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"new").unwrap();
    fx.connector.put_file(TAG, "a.bin.part", b"P").unwrap();
    fx.put_local(TAG, "a.bin", b"old");
    fx.put_local(TAG, "a.bin.part", b"P");
    fx.connector.fail_fetch(&format!("/data/{TAG}/a.bin"));
    let engine = fx.engine();

    let report = engine.sync_device(TAG).await.unwrap();
    assert_eq!(report.planned, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(std::fs::read(fx.mirror_path(TAG, "a.bin.part")).unwrap(), b"P");
    assert_eq!(std::fs::read(fx.mirror_path(TAG, "a.bin")).unwrap(), b"old");
    assert_eq!(mirror_entries(&fx, TAG), vec!["a.bin", "a.bin.part"]);
    assert_eq!(names(&engine.plan(TAG).await.unwrap()), vec!["a.bin"]);
}

#[tokio::test]
async fn sync_with_wrong_credentials_could_not_connect() {
    let mut fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.config.credentials = Credentials::new("pi", "wrong");

    match fx.engine().sync_device(TAG).await {
        Err(EngineError::Connect {
            source: ConnectError::AuthRejected { user, .. },
            ..
        }) => assert_eq!(user, "pi"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!fx.mirror_path(TAG, "a.bin").exists());
}

#[tokio::test]
async fn erase_refused_while_files_pending() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.connector.put_file(TAG, "b.bin", b"b").unwrap();
    fx.put_local(TAG, "a.bin", b"a");

    match fx.engine().erase_device(TAG).await.unwrap() {
        EraseOutcome::Refused { pending } => assert_eq!(names(&pending), vec!["b.bin"]),
        EraseOutcome::Erased => panic!("erased with pending files"),
    }
    assert!(fx.connector.removals().is_empty());
    assert!(fx.connector.data_dir(TAG).join("b.bin").exists());
}

#[tokio::test]
async fn erase_refused_when_local_copy_differs() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"remote").unwrap();
    fx.put_local(TAG, "a.bin", b"corrupt");

    let outcome = fx.engine().erase_device(TAG).await.unwrap();
    assert!(matches!(outcome, EraseOutcome::Refused { .. }));
    assert!(fx.connector.removals().is_empty());
}

#[tokio::test]
async fn erase_after_complete_sync() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.connector.put_file(TAG, "b.bin", b"b").unwrap();
    let engine = fx.engine();

    engine.sync_device(TAG).await.unwrap();
    assert_eq!(engine.erase_device(TAG).await.unwrap(), EraseOutcome::Erased);

    assert_eq!(fx.connector.removals(), vec![format!("/data/{TAG}")]);
    assert!(fx.connector.data_dir(TAG).is_dir());
    assert!(!fx.connector.data_dir(TAG).join("a.bin").exists());
    // Local mirror is untouched
    assert_eq!(std::fs::read(fx.mirror_path(TAG, "a.bin")).unwrap(), b"a");
    assert_eq!(std::fs::read(fx.mirror_path(TAG, "b.bin")).unwrap(), b"b");
}

#[tokio::test]
async fn erase_sees_files_added_after_sync() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    let engine = fx.engine();
    engine.sync_device(TAG).await.unwrap();

    fx.connector.put_file(TAG, "late.bin", b"late").unwrap();
    let outcome = engine.erase_device(TAG).await.unwrap();
    assert!(matches!(outcome, EraseOutcome::Refused { .. }));
    assert!(fx.connector.removals().is_empty());
}

#[tokio::test]
async fn erase_unreachable_issues_nothing() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"a").unwrap();
    fx.connector.set_offline(TAG, true);

    let err = fx.engine().erase_device(TAG).await.unwrap_err();
    assert!(err.is_connect());
    assert!(fx.connector.removals().is_empty());
}

#[tokio::test]
async fn batch_sync_continues_past_unreachable_tag() {
    let fx = Fixture::new();
    let hosts = ["wt-aaaaaaaaaaa1", "wt-aaaaaaaaaaa2", "wt-aaaaaaaaaaa3"];
    for host in hosts {
        fx.connector.put_file(host, "log.bin", host.as_bytes()).unwrap();
    }
    fx.connector.set_offline(hosts[1], true);

    let batch = fx.engine().sync_all(&hosts).await;
    assert_eq!(batch.attempted(), 3);
    assert_eq!(batch.failures(), 1);
    assert!(batch.results[1].1.as_ref().unwrap_err().is_connect());
    assert!(fx.mirror_path(hosts[0], "log.bin").exists());
    assert!(!fx.mirror_path(hosts[1], "log.bin").exists());
    assert!(fx.mirror_path(hosts[2], "log.bin").exists());
}

#[tokio::test]
async fn batch_erase_handles_each_tag_independently() {
    let fx = Fixture::new();
    let synced = "wt-bbbbbbbbbbb1";
    let offline = "wt-bbbbbbbbbbb2";
    let pending = "wt-bbbbbbbbbbb3";
    for host in [synced, offline, pending] {
        fx.connector.put_file(host, "log.bin", b"data").unwrap();
    }
    let engine = fx.engine();
    engine.sync_device(synced).await.unwrap();
    fx.connector.set_offline(offline, true);

    let batch = engine.erase_all(&[synced, offline, pending]).await;
    assert_eq!(batch.attempted(), 3);
    assert!(matches!(batch.results[0].1, Ok(EraseOutcome::Erased)));
    assert!(batch.results[1].1.is_err());
    assert!(matches!(batch.results[2].1, Ok(EraseOutcome::Refused { .. })));
    assert_eq!(fx.connector.removals(), vec![format!("/data/{synced}")]);
}

#[tokio::test]
async fn cancellation_stops_the_batch() {
    let fx = Fixture::new();
    let hosts = ["wt-ccccccccccc1", "wt-ccccccccccc2"];
    for host in hosts {
        fx.connector.put_file(host, "log.bin", b"x").unwrap();
    }
    let token = CancellationToken::new();
    token.cancel();

    let batch = fx
        .engine()
        .with_cancellation(token)
        .sync_all(&hosts)
        .await;
    assert_eq!(batch.attempted(), 1);
    assert!(matches!(batch.results[0].1, Err(EngineError::Cancelled)));
    assert!(!fx.mirror_path(hosts[0], "log.bin").exists());
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SyncObserver for Recorder {
    fn failed(&self, host: &str, error: &EngineError) {
        let kind = if error.is_connect() { "unreachable" } else { "failed" };
        self.push(format!("{kind} {host}"));
    }
    fn planned(&self, host: &str, plan: &TransferPlan) {
        self.push(format!("planned {host} {}", plan.len()));
    }
    fn downloaded(&self, _host: &str, file: &PlannedFile, bytes: u64) {
        self.push(format!("downloaded {} {bytes}", file.name));
    }
    fn synced(&self, report: &SyncReport) {
        self.push(format!("synced {}", report.host));
    }
    fn refused(&self, host: &str, _pending: &TransferPlan) {
        self.push(format!("refused {host}"));
    }
    fn erased(&self, host: &str) {
        self.push(format!("erased {host}"));
    }
}

#[tokio::test]
async fn observer_sees_progress() {
    let fx = Fixture::new();
    fx.connector.put_file(TAG, "a.bin", b"abc").unwrap();
    let recorder = Arc::new(Recorder::default());
    let engine = fx.engine().with_observer(recorder.clone());

    engine.sync_device(TAG).await.unwrap();
    engine.erase_device(TAG).await.unwrap();
    let _ = engine.sync_device("wt-zzzzzzzzzzzz").await;

    assert_eq!(
        recorder.events(),
        vec![
            format!("planned {TAG} 1"),
            "downloaded a.bin 3".to_string(),
            format!("synced {TAG}"),
            format!("erased {TAG}"),
            "unreachable wt-zzzzzzzzzzzz".to_string(),
        ]
    );
}

struct FixedScanner(Vec<IpAddr>);

#[async_trait]
impl HostScanner for FixedScanner {
    async fn scan(&self, _range: &NetworkRange, _port: u16, _per_host: Duration) -> Vec<IpAddr> {
        self.0.clone()
    }
}

struct TableResolver(HashMap<IpAddr, String>);

#[async_trait]
impl HostResolver for TableResolver {
    async fn reverse(&self, addr: IpAddr) -> Option<String> {
        self.0.get(&addr).cloned()
    }
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
}

#[tokio::test]
async fn discovery_keeps_only_confirmed_tags() {
    let fx = Fixture::new();
    fx.connector.add_device("wt-abc123def456").unwrap();
    fx.connector.add_device("random-host-9").unwrap();
    fx.connector.add_device("wt-111111111111").unwrap();
    fx.connector.set_offline("wt-111111111111", true);

    let scanner = FixedScanner(vec![ip(10), ip(11), ip(12), ip(13), ip(14)]);
    let resolver = TableResolver(HashMap::from([
        (ip(10), "random-host-9.lan".to_string()),
        (ip(11), "wt-abc123def456.local".to_string()),
        (ip(12), "wt-111111111111".to_string()),
        // ip(13) does not resolve
        (ip(14), "wt-abc123def456".to_string()),
    ]));

    let discovery = Discovery {
        scanner: &scanner,
        resolver: &resolver,
        connector: &fx.connector,
        options: DiscoveryOptions::from(&fx.config),
    };
    let range = NetworkRange::from_interface(Ipv4Addr::new(192, 168, 1, 2));
    let devices = discovery.discover(&range).await;

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name.as_str(), "wt-abc123def456");
    assert_eq!(devices[0].address, ip(11));
}
