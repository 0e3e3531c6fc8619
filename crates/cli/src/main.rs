//! tagsync: collect data from whale tags on the LAN
//!
//! Finds tags by their `wt-` hostnames, mirrors each tag's data directory
//! into `./data/<hostname>/` and wipes a tag only once everything on it is
//! verified to be mirrored locally.

mod debug_log;
mod progress;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{CommandFactory as _, Parser, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail, eyre};
use tagsync_core::tag::is_tag_hostname;
use tagsync_core::{
    Connector, Device, Discovery, DiscoveryOptions, EraseOutcome, SyncEngine, TagsyncConfig,
    TransferPlan,
};
use tagsync_transport::{SshConnector, SystemResolver, TcpScanner, local_network};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::progress::ConsoleObserver;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "tagsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Download data from whale tags on the LAN and clean them")]
#[command(long_about = r#"
tagsync finds whale tags (hosts named wt-xxxxxxxxxxxx) on the local network,
downloads every new or changed data file over SSH into ./data/<tag>/, and
erases a tag's data only after all of it has been downloaded intact.

Operations may be combined; they run in the order
list, tag, all, clean-tag, clean-all-tags.

Examples:
  tagsync -l                      List tags on the LAN
  tagsync -t wt-abc123def456      Download from one tag
  tagsync -a                      Download from every tag
  tagsync -a --ca                 Download from and then clean every tag
"#)]
struct Cli {
    /// List tags on the LAN
    #[arg(short, long)]
    list: bool,

    /// Download data from one tag
    #[arg(short, long, value_name = "HOST")]
    tag: Option<String>,

    /// Download data from every tag on the LAN
    #[arg(short, long)]
    all: bool,

    /// Erase data on one tag, if all of it has been downloaded
    #[arg(long, visible_alias = "ct", value_name = "HOST")]
    clean_tag: Option<String>,

    /// Erase data on every tag whose data has all been downloaded
    #[arg(long, visible_alias = "ca")]
    clean_all_tags: bool,

    /// Show what would be downloaded without downloading it
    #[arg(long)]
    dry_run: bool,

    /// Output format for --list
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Config file (defaults to ./.tagsync.toml when present)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Local directory holding one folder per tag
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// SSH user on the tags
    #[arg(short, long)]
    user: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    fn has_operation(&self) -> bool {
        self.list
            || self.tag.is_some()
            || self.all
            || self.clean_tag.is_some()
            || self.clean_all_tags
    }

    fn load_config(&self) -> Result<TagsyncConfig> {
        let mut config = match &self.config {
            Some(path) => TagsyncConfig::load_file(path)?,
            None => TagsyncConfig::load(Path::new("."))?,
        };
        if let Some(dir) = &self.data_dir {
            config.data_root.clone_from(dir);
        }
        if let Some(user) = &self.user {
            config.credentials.username.clone_from(user);
        }
        Ok(config)
    }
}

/// Trim a hostname typed on the command line and warn if it is not a tag
fn normalize_host(raw: &str) -> Result<String> {
    let host = raw.trim();
    if host.is_empty() {
        bail!("empty hostname");
    }
    if !is_tag_hostname(host) {
        warn!("{host} does not look like a tag hostname, trying anyway");
    }
    Ok(host.to_string())
}

fn device_names(devices: &[Device]) -> Vec<String> {
    devices.iter().map(|d| d.name.to_string()).collect()
}

struct App {
    engine: SyncEngine,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    dry_run: bool,
    format: OutputFormat,
}

impl App {
    async fn discover(&self) -> Result<Vec<Device>> {
        let config = self.engine.config();
        let range = local_network()?;
        progress::searching(&range);

        let scanner = TcpScanner::new(config.scan_concurrency);
        let discovery = Discovery {
            scanner: &scanner,
            resolver: &SystemResolver,
            connector: self.connector.as_ref(),
            options: DiscoveryOptions::from(config),
        };
        let devices = tokio::select! {
            devices = discovery.discover(&range) => devices,
            () = self.cancel.cancelled() => bail!("cancelled"),
        };

        progress::found(&device_names(&devices));
        Ok(devices)
    }

    async fn list(&self) -> Result<()> {
        let devices = self.discover().await?;
        match self.format {
            OutputFormat::Text => {
                for device in &devices {
                    println!("{}", device.name);
                }
            }
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
        }
        Ok(())
    }

    async fn preview(&self, host: &str) -> Result<()> {
        let plan = self.engine.plan(host).await?;
        print_plan(host, &plan);
        Ok(())
    }

    async fn sync_one(&self, raw: &str) -> Result<()> {
        let host = normalize_host(raw)?;
        if self.dry_run {
            return self.preview(&host).await;
        }
        let report = self.engine.sync_device(&host).await?;
        if !report.is_complete() {
            bail!("{} of {} files from {host} failed", report.failed.len(), report.planned);
        }
        Ok(())
    }

    async fn sync_every(&self) -> Result<()> {
        let names = device_names(&self.discover().await?);
        if self.dry_run {
            let mut failures = 0;
            for host in &names {
                if let Err(e) = self.preview(host).await {
                    error!("{e:#}");
                    failures += 1;
                }
            }
            return batch_result(failures, names.len(), "planned");
        }

        let batch = self.engine.sync_all(names.as_slice()).await;
        let incomplete = batch
            .results
            .iter()
            .filter(|(_, result)| !matches!(result, Ok(report) if report.is_complete()))
            .count();
        batch_result(incomplete, batch.attempted(), "synced")
    }

    async fn clean_one(&self, raw: &str) -> Result<()> {
        let host = normalize_host(raw)?;
        match self.engine.erase_device(&host).await? {
            EraseOutcome::Erased => Ok(()),
            EraseOutcome::Refused { pending } => {
                Err(eyre!("{host} was not erased: {} files not downloaded", pending.len()))
            }
        }
    }

    async fn clean_every(&self) -> Result<()> {
        let names = device_names(&self.discover().await?);
        let batch = self.engine.erase_all(names.as_slice()).await;
        let not_erased = batch
            .results
            .iter()
            .filter(|(_, result)| !matches!(result, Ok(EraseOutcome::Erased)))
            .count();
        batch_result(not_erased, batch.attempted(), "erased")
    }
}

fn batch_result(failures: usize, attempted: usize, verb: &str) -> Result<()> {
    if failures == 0 {
        Ok(())
    } else {
        Err(eyre!("{failures} of {attempted} tags could not be {verb}"))
    }
}

fn print_plan(host: &str, plan: &TransferPlan) {
    if plan.is_empty() {
        println!("{host}: up to date");
        return;
    }
    println!("{host}: {} files to download", plan.len());
    for file in plan.files() {
        println!("  {:<8} {}", file.reason, file.remote_path);
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    if !cli.has_operation() {
        eprintln!("{}", Cli::command().render_help());
        return Ok(ExitCode::FAILURE);
    }

    let session = debug_log::init(cli.verbose);
    debug!("Debug log: {}", session.log_path.display());

    let config = cli.load_config().wrap_err("loading configuration")?;
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let connector: Arc<dyn Connector> =
        Arc::new(SshConnector::new(config.port, config.connect_timeout()));
    let engine = SyncEngine::new(Arc::clone(&connector), config)
        .with_observer(Arc::new(ConsoleObserver::new()))
        .with_cancellation(cancel.clone());
    let app = App {
        engine,
        connector,
        cancel: cancel.clone(),
        dry_run: cli.dry_run,
        format: cli.format,
    };

    let mut ok = true;
    let mut record = |result: Result<()>| {
        if let Err(e) = result {
            error!("{e:#}");
            ok = false;
        }
    };

    if cli.list && !cancel.is_cancelled() {
        record(app.list().await);
    }
    if let Some(host) = cli.tag.as_deref().filter(|_| !cancel.is_cancelled()) {
        record(app.sync_one(host).await);
    }
    if cli.all && !cancel.is_cancelled() {
        record(app.sync_every().await);
    }
    if let Some(host) = cli.clean_tag.as_deref().filter(|_| !cancel.is_cancelled()) {
        record(app.clean_one(host).await);
    }
    if cli.clean_all_tags && !cancel.is_cancelled() {
        record(app.clean_every().await);
    }

    if ok && !cancel.is_cancelled() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Debug log: {}", session.log_path.display());
        Ok(ExitCode::FAILURE)
    }
}
