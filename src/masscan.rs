//! Discovery through parallel masscan processes, one per address chunk.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::ScanError;
use crate::partition::AddressChunk;
use crate::types::{CrawlStats, DiscoveredEndpoint};

/// Flags shared by every scan worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    pub port: u16,
    /// Packets per second, per worker.
    pub rate: u64,
    pub exclude_file: PathBuf,
    pub randomize_hosts: bool,
}

impl ScanParams {
    /// Command-line arguments for scanning `chunk`.
    pub fn args_for(&self, chunk: &AddressChunk) -> Vec<String> {
        let mut args = vec![
            "--open".to_string(),
            "--rate".to_string(),
            self.rate.to_string(),
            "--excludefile".to_string(),
            self.exclude_file.display().to_string(),
        ];
        if self.randomize_hosts {
            args.push("--randomize-hosts".to_string());
        }
        args.push(format!("-p{}", self.port));
        args.push(chunk.to_string());
        args
    }
}

fn discovery_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Discovered open port (\d+)/tcp on ([\d.]+)").expect("discovery pattern is valid")
    })
}

/// Extract the endpoint from a `Discovered open port <port>/tcp on <ip>` line.
pub fn parse_discovery_line(line: &str) -> Option<DiscoveredEndpoint> {
    let caps = discovery_pattern().captures(line)?;
    let port = caps[1].parse().ok()?;
    let ip = caps[2].parse().ok()?;
    Some(DiscoveredEndpoint::new(ip, port))
}

/// Locate the scanner: an explicit path must exist, a bare name is looked up on `PATH`.
pub fn resolve_binary(binary: &Path) -> Result<PathBuf, ScanError> {
    let missing = || ScanError::BinaryMissing(binary.to_path_buf());
    if binary.components().count() > 1 || binary.is_absolute() {
        return if binary.is_file() {
            Ok(binary.to_path_buf())
        } else {
            Err(missing())
        };
    }
    let path_var = std::env::var_os("PATH").ok_or_else(missing)?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
        .ok_or_else(missing)
}

/// How a scan worker ended.
#[derive(Debug)]
pub enum WorkerExit {
    Finished(ExitStatus),
    Killed,
    WaitFailed(std::io::Error),
}

impl WorkerExit {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Finished(status) if status.success())
    }
}

/// A running scan subprocess and the task supervising it.
#[derive(Debug)]
pub struct ScanWorker {
    pub chunk: AddressChunk,
    pub pid: Option<u32>,
    handle: JoinHandle<WorkerExit>,
}

/// Launches and tracks the scan subprocesses for one session.
///
/// Every worker shares `cancel`; firing it kills and reaps each child. Dropping
/// the orchestrator aborts the supervising tasks, which kills any child left.
#[derive(Debug)]
pub struct ScanOrchestrator {
    binary: PathBuf,
    params: ScanParams,
    stats: CrawlStats,
    workers: Vec<ScanWorker>,
}

impl ScanOrchestrator {
    pub fn new(binary: PathBuf, params: ScanParams, stats: CrawlStats) -> Self {
        Self {
            binary,
            params,
            stats,
            workers: Vec::new(),
        }
    }

    pub fn workers(&self) -> &[ScanWorker] {
        &self.workers
    }

    /// Start one scanner per chunk, all feeding `discoveries`.
    ///
    /// A worker that fails to spawn is logged and skipped; only when none start is it an error.
    pub fn launch(
        &mut self,
        chunks: &[AddressChunk],
        discoveries: mpsc::UnboundedSender<DiscoveredEndpoint>,
        cancel: &CancellationToken,
    ) -> Result<usize, ScanError> {
        let mut first_err = None;
        let mut started = 0;
        for chunk in chunks {
            let args = self.params.args_for(chunk);
            info!(binary = %self.binary.display(), args = %args.join(" "), "starting scan worker");
            let spawned = Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(child) => {
                    let pid = child.id();
                    let handle = tokio::spawn(supervise(
                        child,
                        *chunk,
                        discoveries.clone(),
                        cancel.clone(),
                        self.stats.clone(),
                    ));
                    self.workers.push(ScanWorker {
                        chunk: *chunk,
                        pid,
                        handle,
                    });
                    started += 1;
                }
                Err(source) => {
                    CrawlStats::bump(&self.stats.scanner_failures);
                    warn!(%chunk, error = %source, "failed to start scan worker");
                    first_err.get_or_insert(ScanError::Spawn {
                        chunk: chunk.to_string(),
                        source,
                    });
                }
            }
        }
        match first_err {
            Some(err) if started == 0 => Err(err),
            _ => Ok(started),
        }
    }

    /// Wait for every worker to exit (naturally or through cancellation).
    pub async fn wait_all(&mut self) -> Vec<(AddressChunk, WorkerExit)> {
        let mut exits = Vec::with_capacity(self.workers.len());
        for worker in self.workers.drain(..) {
            let exit = match worker.handle.await {
                Ok(exit) => exit,
                Err(e) => WorkerExit::WaitFailed(std::io::Error::other(e)),
            };
            exits.push((worker.chunk, exit));
        }
        exits
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.abort();
        }
    }
}

async fn supervise(
    mut child: Child,
    chunk: AddressChunk,
    discoveries: mpsc::UnboundedSender<DiscoveredEndpoint>,
    cancel: CancellationToken,
    stats: CrawlStats,
) -> WorkerExit {
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_discoveries(out, chunk, discoveries, stats.clone())));
    let stderr = child.stderr.take().map(|err| tokio::spawn(log_diagnostics(err, chunk)));

    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => WorkerExit::Finished(status),
            Err(e) => WorkerExit::WaitFailed(e),
        },
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(%chunk, error = %e, "failed to kill scan worker");
            }
            WorkerExit::Killed
        }
    };

    // Output still buffered in the pipes is part of this worker's discovery,
    // unless the worker was killed. A grandchild may hold the pipe open, so
    // draining stops at shutdown too.
    for mut task in [stdout, stderr].into_iter().flatten() {
        if matches!(exit, WorkerExit::Killed) {
            task.abort();
            continue;
        }
        tokio::select! {
            _ = &mut task => {}
            _ = cancel.cancelled() => {
                debug!(%chunk, "scanner output still open at shutdown");
                task.abort();
            }
        }
    }

    match &exit {
        WorkerExit::Finished(status) if status.success() => info!(%chunk, "scan worker finished"),
        WorkerExit::Finished(status) => {
            CrawlStats::bump(&stats.scanner_failures);
            warn!(%chunk, %status, "scan worker exited with failure");
        }
        WorkerExit::Killed => info!(%chunk, "scan worker terminated"),
        WorkerExit::WaitFailed(e) => {
            CrawlStats::bump(&stats.scanner_failures);
            warn!(%chunk, error = %e, "lost track of scan worker");
        }
    }
    exit
}

async fn forward_discoveries(
    stdout: impl AsyncRead + Unpin,
    chunk: AddressChunk,
    discoveries: mpsc::UnboundedSender<DiscoveredEndpoint>,
    stats: CrawlStats,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(%chunk, line = %line, "scanner stdout");
                let Some(endpoint) = parse_discovery_line(&line) else { continue };
                CrawlStats::bump(&stats.discovered);
                info!(%endpoint, "found");
                if discoveries.send(endpoint).is_err() {
                    debug!(%chunk, "discovery channel closed");
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(%chunk, error = %e, "failed to read scanner output");
                return;
            }
        }
    }
}

async fn log_diagnostics(stderr: impl AsyncRead + Unpin, chunk: AddressChunk) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%chunk, line = %line, "scanner stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_discovery_lines() {
        let ep = parse_discovery_line("Discovered open port 25565/tcp on 93.184.216.34").unwrap();
        assert_eq!(ep, DiscoveredEndpoint::new(Ipv4Addr::new(93, 184, 216, 34), 25565));

        let ep = parse_discovery_line("  Discovered open port 25566/tcp on 10.1.2.3   \r").unwrap();
        assert_eq!(ep.port, 25566);
    }

    #[test]
    fn ignores_other_lines() {
        assert!(parse_discovery_line("rate:  0.10-kpps, 1.23% done").is_none());
        assert!(parse_discovery_line("Discovered open port 99999/tcp on 10.0.0.1").is_none());
        assert!(parse_discovery_line("Discovered open port 80/tcp on 999.0.0.1").is_none());
        assert!(parse_discovery_line("").is_none());
    }

    #[test]
    fn worker_arguments() {
        let params = ScanParams {
            port: 25565,
            rate: 100_000,
            exclude_file: PathBuf::from("exclude.conf"),
            randomize_hosts: true,
        };
        let chunk = AddressChunk {
            start: Ipv4Addr::new(0, 0, 0, 0),
            end: Ipv4Addr::new(21, 85, 85, 85),
        };
        assert_eq!(
            params.args_for(&chunk),
            vec![
                "--open",
                "--rate",
                "100000",
                "--excludefile",
                "exclude.conf",
                "--randomize-hosts",
                "-p25565",
                "0.0.0.0-21.85.85.85",
            ]
        );
    }

    #[test]
    fn missing_binary_is_reported() {
        let err = resolve_binary(Path::new("/nonexistent/masscan")).unwrap_err();
        assert!(matches!(err, ScanError::BinaryMissing(_)));
        let err = resolve_binary(Path::new("definitely-not-a-real-scanner-binary")).unwrap_err();
        assert!(matches!(err, ScanError::BinaryMissing(_)));
    }
}
