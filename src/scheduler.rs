use std::collections::{HashSet, VecDeque};
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info};

use crate::error::ProtocolError;
use crate::exclude::ExclusionList;
use crate::protocol::{PingOutcome, StatusProbe};
use crate::store::{InsertOutcome, ResultStore};
use crate::types::{CrawlStats, DiscoveredEndpoint};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum number of status pings in flight at once.
    pub workers: usize,
    /// Retries after the first attempt before an endpoint is written off.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            retries: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Where a query task currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    InFlight,
    Retrying,
    Indexed,
    Offline,
}

/// One endpoint's trip through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTask {
    pub endpoint: DiscoveredEndpoint,
    pub retries_remaining: u32,
    pub attempts: u32,
    pub state: QueryState,
}

impl QueryTask {
    pub fn new(endpoint: DiscoveredEndpoint, retries: u32) -> Self {
        Self {
            endpoint,
            retries_remaining: retries,
            attempts: 0,
            state: QueryState::Pending,
        }
    }

    fn start(mut self) -> Self {
        self.attempts += 1;
        self.state = QueryState::InFlight;
        self
    }

    /// Next state after an attempt without a usable answer.
    pub fn after_no_response(mut self) -> Self {
        if self.retries_remaining == 0 {
            self.state = QueryState::Offline;
        } else {
            self.retries_remaining -= 1;
            self.state = QueryState::Retrying;
        }
        self
    }

    pub fn after_online(mut self) -> Self {
        self.state = QueryState::Indexed;
        self
    }
}

enum Attempt {
    Online(InsertOutcome),
    NoResponse(ProtocolError),
    /// Shutdown arrived before the server answered.
    Cancelled,
}

/// What happened to the work the scheduler was given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Unique endpoints that became query tasks.
    pub tasks: u64,
    /// Tasks queued, backing off or still waiting on a ping when a shutdown arrived.
    pub abandoned: usize,
}

/// Bounded-concurrency status querying for discovered endpoints.
///
/// Discovery arrives on an unbounded channel at whatever rate the scanners
/// produce; tasks wait in an in-memory queue until one of the `workers` slots
/// frees up. Each `(ip, port)` becomes at most one task per scheduler.
pub struct QueryScheduler<P: StatusProbe> {
    probe: Arc<P>,
    store: Arc<ResultStore>,
    exclusions: Arc<ExclusionList>,
    stats: CrawlStats,
    config: SchedulerConfig,
    claimed: HashSet<DiscoveredEndpoint>,
}

impl<P: StatusProbe> QueryScheduler<P> {
    pub fn new(
        probe: Arc<P>,
        store: Arc<ResultStore>,
        exclusions: Arc<ExclusionList>,
        stats: CrawlStats,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            probe,
            store,
            exclusions,
            stats,
            config,
            claimed: HashSet::new(),
        }
    }

    /// Drive queries until discovery closes and every task is finished, or until `cancel` fires.
    ///
    /// On cancellation queued and backing-off tasks are dropped and pings still
    /// waiting on the network are abandoned. An insert that has already started
    /// runs to completion so its write is not cut short.
    pub async fn run(
        mut self,
        mut discoveries: mpsc::UnboundedReceiver<DiscoveredEndpoint>,
        cancel: CancellationToken,
    ) -> SchedulerReport {
        let workers = self.config.workers.max(1);
        let mut pending: VecDeque<QueryTask> = VecDeque::new();
        let mut retrying: DelayQueue<QueryTask> = DelayQueue::new();
        let mut in_flight: JoinSet<(QueryTask, Attempt)> = JoinSet::new();
        let mut input_open = true;
        let mut stopping = false;
        let mut report = SchedulerReport::default();

        loop {
            while in_flight.len() < workers {
                let Some(task) = pending.pop_front() else { break };
                self.dispatch(&mut in_flight, task, &cancel);
            }
            if !input_open && pending.is_empty() && retrying.is_empty() && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    input_open = false;
                    report.abandoned = pending.len() + retrying.len();
                    pending.clear();
                    retrying.clear();
                    discoveries.close();
                    info!(in_flight = in_flight.len(), abandoned = report.abandoned, "query scheduler stopping");
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((task, Attempt::Cancelled)) => {
                            report.abandoned += 1;
                            debug!(endpoint = %task.endpoint, "ping abandoned at shutdown");
                        }
                        Ok((task, attempt)) => self.complete(task, attempt, &mut retrying),
                        Err(e) => error!(error = %e, "query task failed"),
                    }
                    if stopping && !retrying.is_empty() {
                        report.abandoned += retrying.len();
                        retrying.clear();
                    }
                }
                Some(expired) = poll_fn(|cx| retrying.poll_expired(cx)), if !retrying.is_empty() => {
                    pending.push_back(expired.into_inner());
                }
                received = discoveries.recv(), if input_open => match received {
                    Some(endpoint) => {
                        if let Some(task) = self.admit(endpoint).await {
                            report.tasks += 1;
                            pending.push_back(task);
                        }
                    }
                    None => input_open = false,
                },
            }
        }
        report
    }

    async fn admit(&mut self, endpoint: DiscoveredEndpoint) -> Option<QueryTask> {
        if self.exclusions.contains(endpoint.ip) {
            CrawlStats::bump(&self.stats.excluded);
            debug!(%endpoint, "endpoint is excluded");
            return None;
        }
        if self.store.contains(&endpoint).await {
            CrawlStats::bump(&self.stats.duplicates);
            debug!(%endpoint, "server already indexed");
            return None;
        }
        if !self.claimed.insert(endpoint) {
            CrawlStats::bump(&self.stats.duplicates);
            debug!(%endpoint, "endpoint already queued");
            return None;
        }
        Some(QueryTask::new(endpoint, self.config.retries))
    }

    fn dispatch(
        &self,
        in_flight: &mut JoinSet<(QueryTask, Attempt)>,
        task: QueryTask,
        cancel: &CancellationToken,
    ) {
        let task = task.start();
        let probe = self.probe.clone();
        let store = self.store.clone();
        let cancel = cancel.clone();
        CrawlStats::bump(&self.stats.probes);
        in_flight.spawn(async move {
            let endpoint = task.endpoint;
            let outcome = tokio::select! {
                outcome = probe.probe(endpoint.ip, endpoint.port) => outcome,
                _ = cancel.cancelled() => return (task, Attempt::Cancelled),
            };
            // Past this point the insert is not raced against shutdown.
            let attempt = match outcome {
                PingOutcome::Online(status) => Attempt::Online(store.record_status(endpoint, &status).await),
                PingOutcome::NoResponse(reason) => Attempt::NoResponse(reason),
            };
            (task, attempt)
        });
    }

    fn complete(&self, task: QueryTask, attempt: Attempt, retrying: &mut DelayQueue<QueryTask>) {
        let endpoint = task.endpoint;
        match attempt {
            Attempt::Online(InsertOutcome::Inserted { persisted }) => {
                let done = task.after_online();
                CrawlStats::bump(&self.stats.indexed);
                info!(%endpoint, persisted, attempts = done.attempts, "server indexed");
            }
            Attempt::Online(InsertOutcome::Duplicate) => {
                CrawlStats::bump(&self.stats.duplicates);
                debug!(%endpoint, "server indexed concurrently, record discarded");
            }
            Attempt::Cancelled => {}
            Attempt::NoResponse(reason) => {
                let next = task.after_no_response();
                if next.state == QueryState::Retrying {
                    CrawlStats::bump(&self.stats.retries);
                    debug!(%endpoint, %reason, retries_left = next.retries_remaining, "no response, retrying");
                    retrying.insert(next, self.config.backoff);
                } else {
                    CrawlStats::bump(&self.stats.offline);
                    debug!(%endpoint, %reason, attempts = next.attempts, "server offline");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn task(retries: u32) -> QueryTask {
        QueryTask::new(DiscoveredEndpoint::new(Ipv4Addr::new(192, 0, 2, 1), 25565), retries)
    }

    #[test]
    fn retry_budget_counts_down_to_offline() {
        let mut t = task(2).start();
        t = t.after_no_response();
        assert_eq!((t.state, t.retries_remaining), (QueryState::Retrying, 1));
        t = t.start().after_no_response();
        assert_eq!((t.state, t.retries_remaining), (QueryState::Retrying, 0));
        t = t.start().after_no_response();
        assert_eq!(t.state, QueryState::Offline);
        assert_eq!(t.attempts, 3);
    }

    #[test]
    fn zero_retries_goes_straight_offline() {
        let t = task(0).start().after_no_response();
        assert_eq!(t.state, QueryState::Offline);
        assert_eq!(t.attempts, 1);
    }

    #[test]
    fn online_is_terminal() {
        let t = task(3).start().after_online();
        assert_eq!(t.state, QueryState::Indexed);
    }
}
