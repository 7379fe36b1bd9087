use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mc_server_indexer::config::CrawlConfig;
use mc_server_indexer::crawl::Crawler;
use mc_server_indexer::supervisor::{LifecycleSupervisor, Supervised};

/// mc-server-indexer: sweep the IPv4 space with masscan and index every Minecraft server that answers a status ping.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mc-server-indexer",
    version,
    about = "Sweep the IPv4 space with masscan and index every Minecraft server that answers a status ping.",
    long_about = None
)]
struct Cli {
    /// TOML config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// masscan executable (path or name on PATH).
    #[arg(long)]
    scanner: Option<PathBuf>,

    /// Exclusion file passed to masscan.
    #[arg(long = "exclude-file")]
    exclude_file: Option<PathBuf>,

    /// Range to sweep: `a.b.c.d-e.f.g.h`, CIDR, or single address.
    #[arg(long)]
    range: Option<String>,

    /// TCP port to look for servers on.
    #[arg(long)]
    port: Option<u16>,

    /// Number of parallel masscan processes.
    #[arg(long = "scan-workers")]
    scan_workers: Option<usize>,

    /// masscan rate (packets/s) per process.
    #[arg(long)]
    rate: Option<u64>,

    /// Max concurrent status pings.
    #[arg(long = "query-workers")]
    query_workers: Option<usize>,

    /// Status ping timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Retries for an endpoint that does not answer.
    #[arg(long)]
    retries: Option<u32>,

    /// Delay before retrying an endpoint, in milliseconds.
    #[arg(long = "retry-backoff-ms")]
    retry_backoff_ms: Option<u64>,

    /// Protocol number announced in the handshake.
    #[arg(long = "protocol-version")]
    protocol_version: Option<i32>,

    /// Whether masscan visits hosts in random order (`true`/`false`).
    #[arg(long = "randomize-hosts")]
    randomize_hosts: Option<bool>,

    /// Seconds in-flight work may take to finish after Ctrl-C/SIGTERM.
    #[arg(long = "grace-secs")]
    grace_secs: Option<u64>,

    /// Index file to load and rewrite.
    #[arg(long)]
    index: Option<PathBuf>,

    /// Start a new session whenever one completes.
    #[arg(long, default_value_t = false)]
    continuous: bool,

    /// Program run with the index path after each completed session.
    #[arg(long = "post-session-hook")]
    post_session_hook: Option<PathBuf>,

    /// More output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply(&self, cfg: &mut CrawlConfig) {
        if let Some(v) = &self.scanner {
            cfg.scanner_binary = v.clone();
        }
        if let Some(v) = &self.exclude_file {
            cfg.exclude_file = v.clone();
        }
        if let Some(v) = &self.range {
            cfg.range = v.clone();
        }
        if let Some(v) = self.port {
            cfg.target_port = v;
        }
        if let Some(v) = self.scan_workers {
            cfg.scan_workers = v;
        }
        if let Some(v) = self.rate {
            cfg.scan_rate = v;
        }
        if let Some(v) = self.query_workers {
            cfg.query_workers = v;
        }
        if let Some(v) = self.timeout_ms {
            cfg.query_timeout_ms = v;
        }
        if let Some(v) = self.retries {
            cfg.retries = v;
        }
        if let Some(v) = self.retry_backoff_ms {
            cfg.retry_backoff_ms = v;
        }
        if let Some(v) = self.protocol_version {
            cfg.protocol_version = v;
        }
        if let Some(v) = self.randomize_hosts {
            cfg.randomize_hosts = v;
        }
        if let Some(v) = self.grace_secs {
            cfg.shutdown_grace_secs = v;
        }
        if let Some(v) = &self.index {
            cfg.index_path = v.clone();
        }
        if self.continuous {
            cfg.continuous = true;
        }
        if let Some(v) = &self.post_session_hook {
            cfg.post_session_hook = Some(v.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => CrawlConfig::load(path)?,
        None => CrawlConfig::default(),
    };
    cli.apply(&mut config);

    info!(
        range = %config.range,
        port = config.target_port,
        scan_workers = config.scan_workers,
        query_workers = config.query_workers,
        index = %config.index_path.display(),
        "starting crawler"
    );

    let supervisor = LifecycleSupervisor::new(config.shutdown_grace());
    let crawler = Crawler::prepare(config).await?;
    supervisor.listen_for_signals();

    match supervisor.supervise(crawler.run(supervisor.token())).await {
        Supervised::Completed(res) => res?,
        Supervised::Drained(res) => {
            res?;
            info!("shutdown complete");
        }
        Supervised::GraceExpired => {
            warn!("exiting with work still in flight");
            if let Err(e) = crawler.store().flush_if_dirty().await {
                error!(error = %e, "final index flush failed");
            }
        }
    }
    Ok(())
}
