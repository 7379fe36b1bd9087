//! A crawl session: partition, scan, query, index.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CrawlConfig;
use crate::dns::{DnsCache, SystemResolver};
use crate::exclude::{load_exclusions, ExclusionList};
use crate::masscan::{resolve_binary, ScanOrchestrator};
use crate::partition::split_range;
use crate::protocol::{StatusProbe, TcpStatusProbe};
use crate::scheduler::{QueryScheduler, SchedulerReport};
use crate::store::ResultStore;
use crate::types::{CrawlStats, StatsSnapshot};

/// What one session did.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub workers_started: usize,
    pub workers_failed: usize,
    pub tasks: u64,
    pub abandoned: usize,
    pub index_size: usize,
    pub interrupted: bool,
    /// Counters for this session alone.
    pub stats: StatsSnapshot,
}

/// The crawl context: every shared component, owned in one place and handed to
/// each session explicitly.
pub struct Crawler<P: StatusProbe = TcpStatusProbe> {
    config: CrawlConfig,
    scanner: PathBuf,
    exclusions: Arc<ExclusionList>,
    store: Arc<ResultStore>,
    probe: Arc<P>,
    stats: CrawlStats,
}

impl Crawler<TcpStatusProbe> {
    /// Check everything a crawl depends on before any scanner starts.
    ///
    /// Fails on an invalid config, a missing scanner binary, an unreadable
    /// exclusion file, or an index file that cannot be loaded.
    pub async fn prepare(config: CrawlConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let scanner = resolve_binary(&config.scanner_binary)?;
        let exclusions = load_exclusions(&config.exclude_file)?;
        info!(
            scanner = %scanner.display(),
            exclusions = exclusions.len(),
            "scanner ready"
        );
        let dns = DnsCache::spawn(SystemResolver);
        let store = ResultStore::open(&config.index_path, dns)
            .await
            .context("failed to open index")?;
        let probe = config.probe();
        Ok(Self::from_parts(
            config,
            scanner,
            exclusions,
            Arc::new(store),
            probe,
        ))
    }
}

impl<P: StatusProbe> Crawler<P> {
    pub fn from_parts(
        config: CrawlConfig,
        scanner: PathBuf,
        exclusions: ExclusionList,
        store: Arc<ResultStore>,
        probe: P,
    ) -> Self {
        Self {
            config,
            scanner,
            exclusions: Arc::new(exclusions),
            store,
            probe: Arc::new(probe),
            stats: CrawlStats::new(),
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    /// Run sessions until one completes (or forever in continuous mode), or until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let progress_stop = cancel.child_token();
        if let Some(every) = self.config.progress_interval() {
            tokio::spawn(log_progress(self.stats.clone(), every, progress_stop.clone()));
        }

        let result = self.run_sessions(&cancel).await;

        progress_stop.cancel();
        if let Err(e) = self.store.flush_if_dirty().await {
            error!(error = %e, "final index flush failed");
        }
        result
    }

    async fn run_sessions(&self, cancel: &CancellationToken) -> Result<()> {
        let mut session = 0u64;
        loop {
            session += 1;
            let summary = self.run_session(cancel).await?;
            info!(
                session,
                discovered = summary.stats.discovered,
                indexed = summary.stats.indexed,
                offline = summary.stats.offline,
                index_size = summary.index_size,
                interrupted = summary.interrupted,
                "session finished"
            );
            if summary.interrupted {
                return Ok(());
            }
            if let Some(hook) = &self.config.post_session_hook {
                run_hook(hook, self.store.path(), cancel).await;
            }
            if !self.config.continuous || cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    /// One sweep of the configured range: every scan worker runs to the end and
    /// every discovered endpoint is resolved before this returns.
    pub async fn run_session(&self, cancel: &CancellationToken) -> Result<SessionSummary> {
        let range = self.config.scan_range()?;
        let chunks = split_range(range, self.config.scan_workers)?;
        let session_cancel = cancel.child_token();
        let before = self.stats.snapshot();

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = QueryScheduler::new(
            self.probe.clone(),
            self.store.clone(),
            self.exclusions.clone(),
            self.stats.clone(),
            self.config.scheduler(),
        );
        let query = tokio::spawn(scheduler.run(rx, session_cancel.clone()));

        let mut orchestrator = ScanOrchestrator::new(
            self.scanner.clone(),
            self.config.scan_params(),
            self.stats.clone(),
        );
        // `launch` consumes the only sender; the scheduler sees end-of-input once
        // every worker's output is drained.
        let launched = orchestrator.launch(&chunks, tx, &session_cancel);
        let workers_started = match launched {
            Ok(n) => n,
            Err(e) => {
                session_cancel.cancel();
                let _ = query.await;
                return Err(e).context("no scan worker could be started");
            }
        };
        info!(workers = workers_started, chunks = chunks.len(), "scan session started");
        for worker in orchestrator.workers() {
            debug!(chunk = %worker.chunk, pid = ?worker.pid, "scan worker running");
        }

        let exits = orchestrator.wait_all().await;
        let workers_failed = exits.iter().filter(|(_, exit)| !exit.is_success()).count();
        let report: SchedulerReport = query.await.context("query scheduler panicked")?;

        Ok(SessionSummary {
            workers_started,
            workers_failed,
            tasks: report.tasks,
            abandoned: report.abandoned,
            index_size: self.store.len().await,
            interrupted: cancel.is_cancelled(),
            stats: self.stats.snapshot().since(&before),
        })
    }
}

async fn log_progress(stats: CrawlStats, every: Duration, stop: CancellationToken) {
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let s = stats.snapshot();
                info!(
                    discovered = s.discovered,
                    probes = s.probes,
                    retries = s.retries,
                    indexed = s.indexed,
                    offline = s.offline,
                    duplicates = s.duplicates,
                    "progress"
                );
            }
        }
    }
}

/// Hand the finished index to an external program (e.g. a publisher).
async fn run_hook(hook: &Path, index: &Path, cancel: &CancellationToken) {
    info!(hook = %hook.display(), "running post-session hook");
    let status = Command::new(hook).arg(index).kill_on_drop(true).status();
    tokio::select! {
        res = status => match res {
            Ok(s) if s.success() => info!("post-session hook finished"),
            Ok(s) => warn!(status = %s, "post-session hook failed"),
            Err(e) => warn!(error = %e, "could not run post-session hook"),
        },
        _ = cancel.cancelled() => warn!("post-session hook interrupted"),
    }
}
