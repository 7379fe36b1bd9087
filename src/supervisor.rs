use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How supervised work came to an end.
#[derive(Debug, PartialEq, Eq)]
pub enum Supervised<T> {
    /// Finished on its own.
    Completed(T),
    /// Finished within the grace period after a shutdown request.
    Drained(T),
    /// Still running when the grace period ran out; it was dropped.
    GraceExpired,
}

/// Turns interrupt signals into one cancellation and bounds how long shutdown may take.
///
/// Components watch [`LifecycleSupervisor::token`]: scan workers kill their
/// subprocesses and the scheduler stops dispatching. Work still running after
/// the grace period is dropped, and every scanner child is spawned with
/// `kill_on_drop`, so no process outlives the crawler.
#[derive(Debug, Clone)]
pub struct LifecycleSupervisor {
    shutdown: CancellationToken,
    grace: Duration,
}

impl LifecycleSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            grace,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel the shared token on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => {
                    info!("interrupt received, shutting down");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }

    /// Run `work` to completion, or until shutdown plus the grace period.
    pub async fn supervise<F, T>(&self, work: F) -> Supervised<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(work);
        let result = tokio::select! {
            out = &mut work => Supervised::Completed(out),
            _ = self.shutdown.cancelled() => {
                info!(grace_secs = self.grace.as_secs_f64(), "waiting for in-flight work");
                match time::timeout(self.grace, &mut work).await {
                    Ok(out) => Supervised::Drained(out),
                    Err(_) => {
                        warn!("grace period expired, abandoning remaining work");
                        Supervised::GraceExpired
                    }
                }
            }
        };
        // Whatever ended the work, nothing tied to the token may keep running.
        self.shutdown.cancel();
        result
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C will stop the crawler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_without_shutdown() {
        let sup = LifecycleSupervisor::new(Duration::from_secs(1));
        let out = sup.supervise(async { 7 }).await;
        assert_eq!(out, Supervised::Completed(7));
        assert!(sup.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn drains_cooperative_work_within_grace() {
        let sup = LifecycleSupervisor::new(Duration::from_secs(5));
        let token = sup.token();
        let work = async move {
            token.cancelled().await;
            time::sleep(Duration::from_secs(1)).await;
            "flushed"
        };
        let trigger = sup.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            trigger.request_shutdown();
        });
        assert_eq!(sup.supervise(work).await, Supervised::Drained("flushed"));
    }

    #[tokio::test(start_paused = true)]
    async fn abandons_work_after_grace() {
        let sup = LifecycleSupervisor::new(Duration::from_secs(2));
        sup.request_shutdown();
        let start = time::Instant::now();
        let out: Supervised<()> = sup.supervise(std::future::pending()).await;
        assert_eq!(out, Supervised::GraceExpired);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
