//! Reverse-DNS cache for indexed servers.
//!
//! Reads are synchronous and best-effort. All writes go through one actor task,
//! which also guarantees at most one lookup in flight per address.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Source of PTR names for an address.
pub trait ReverseResolver: Send + Sync + 'static {
    fn reverse(&self, ip: Ipv4Addr) -> impl Future<Output = io::Result<Vec<String>>> + Send;
}

/// Resolver backed by the system's `getnameinfo`, run off the async workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl ReverseResolver for SystemResolver {
    fn reverse(&self, ip: Ipv4Addr) -> impl Future<Output = io::Result<Vec<String>>> + Send {
        async move {
            tokio::task::spawn_blocking(move || {
                dns_lookup::lookup_addr(&IpAddr::V4(ip)).map(|name| vec![name])
            })
            .await
            .map_err(io::Error::other)?
        }
    }
}

fn hostname_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9-]+\.[a-zA-Z0-9-]+\.[a-zA-Z]{2,}$").expect("hostname pattern is valid")
    })
}

/// Pick the first name shaped like `host.domain.tld`; otherwise fall back to the address.
pub fn pick_hostname(ip: Ipv4Addr, names: &[String]) -> String {
    names
        .iter()
        .find(|n| hostname_pattern().is_match(n))
        .cloned()
        .unwrap_or_else(|| ip.to_string())
}

/// Handle to the cache. Cheap to clone; the actor stops once every handle is gone.
#[derive(Clone, Debug)]
pub struct DnsCache {
    entries: Arc<RwLock<HashMap<Ipv4Addr, String>>>,
    requests: mpsc::UnboundedSender<Ipv4Addr>,
}

impl DnsCache {
    /// Start the cache actor on the current runtime.
    pub fn spawn<R: ReverseResolver>(resolver: R) -> Self {
        let entries = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_actor(Arc::new(resolver), entries.clone(), rx));
        Self {
            entries,
            requests: tx,
        }
    }

    /// Cached name for `ip`, if a lookup has finished.
    pub fn cached(&self, ip: Ipv4Addr) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip)
            .cloned()
    }

    /// Cached name for `ip`, or the address itself while a lookup is started in the background.
    pub fn hostname_or_ip(&self, ip: Ipv4Addr) -> String {
        match self.cached(ip) {
            Some(name) => name,
            None => {
                self.request(ip);
                ip.to_string()
            }
        }
    }

    /// Ask for `ip` to be resolved. Repeated requests are collapsed by the actor.
    pub fn request(&self, ip: Ipv4Addr) {
        // A closed channel only happens while the runtime is shutting down.
        let _ = self.requests.send(ip);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_actor<R: ReverseResolver>(
    resolver: Arc<R>,
    entries: Arc<RwLock<HashMap<Ipv4Addr, String>>>,
    mut requests: mpsc::UnboundedReceiver<Ipv4Addr>,
) {
    let mut in_flight = HashSet::new();
    let mut lookups = JoinSet::new();
    loop {
        tokio::select! {
            Some(ip) = requests.recv() => {
                let known = entries
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains_key(&ip);
                if known || !in_flight.insert(ip) {
                    continue;
                }
                let resolver = resolver.clone();
                lookups.spawn(async move {
                    let res = resolver.reverse(ip).await;
                    (ip, res)
                });
            }
            Some(joined) = lookups.join_next(), if !lookups.is_empty() => {
                let (ip, res) = match joined {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "reverse lookup task failed");
                        continue;
                    }
                };
                in_flight.remove(&ip);
                let name = match res {
                    Ok(names) => pick_hostname(ip, &names),
                    Err(e) => {
                        debug!(%ip, error = %e, "reverse lookup failed");
                        ip.to_string()
                    }
                };
                entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(ip, name);
            }
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeResolver {
        calls: AtomicUsize,
    }

    impl ReverseResolver for Arc<FakeResolver> {
        fn reverse(&self, ip: Ipv4Addr) -> impl Future<Output = io::Result<Vec<String>>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if ip.octets()[3] == 1 {
                    Ok(vec!["localhost".into(), "mc.example.com".into()])
                } else {
                    Err(io::Error::new(io::ErrorKind::NotFound, "no PTR"))
                }
            }
        }
    }

    async fn settle(cache: &DnsCache, ip: Ipv4Addr) -> String {
        for _ in 0..100 {
            if let Some(name) = cache.cached(ip) {
                return name;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lookup for {ip} never finished");
    }

    #[test]
    fn picks_three_label_names_only() {
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        let names = vec!["box".to_string(), "a.b.example.com".into(), "play.example.net".into()];
        assert_eq!(pick_hostname(ip, &names), "play.example.net");
        assert_eq!(pick_hostname(ip, &["box".to_string()]), "1.2.3.4");
    }

    #[tokio::test]
    async fn first_read_is_ip_then_resolved_name() {
        let resolver = Arc::new(FakeResolver::default());
        let cache = DnsCache::spawn(resolver.clone());
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(cache.hostname_or_ip(ip), "10.0.0.1");
        assert_eq!(settle(&cache, ip).await, "mc.example.com");
        assert_eq!(cache.hostname_or_ip(ip), "mc.example.com");
    }

    #[tokio::test]
    async fn failed_lookup_caches_ip() {
        let cache = DnsCache::spawn(Arc::new(FakeResolver::default()));
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        cache.request(ip);
        assert_eq!(settle(&cache, ip).await, "10.0.0.2");
    }

    #[tokio::test]
    async fn one_lookup_per_address() {
        let resolver = Arc::new(FakeResolver::default());
        let cache = DnsCache::spawn(resolver.clone());
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        for _ in 0..50 {
            cache.request(ip);
        }
        settle(&cache, ip).await;
        cache.request(ip);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }
}
