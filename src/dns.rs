//! Reverse-DNS enrichment.
//!
//! The aggregator enqueues every newly seen address; a worker drains the
//! queue a few addresses per tick and records the outcome. Failures are
//! cached as `None` and never retried for the life of the cache.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::DnsTuning;

pub trait ReverseResolver: Send + Sync {
    /// PTR name for `ip`, or `None` when it has none or the lookup failed.
    fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver backed by the system's `getnameinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl ReverseResolver for SystemResolver {
    fn reverse(&self, ip: IpAddr) -> Option<String> {
        match dns_lookup::lookup_addr(&ip) {
            // getnameinfo hands back the numeric form when there is no PTR record
            Ok(hostname) if !hostname.is_empty() && hostname != ip.to_string() => Some(hostname),
            Ok(_) => None,
            Err(e) => {
                debug!(%ip, error = %e, "reverse lookup failed");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct DnsState {
    resolved: HashMap<IpAddr, Option<String>>,
    queue: VecDeque<IpAddr>,
    // queued or in flight
    pending: HashSet<IpAddr>,
}

#[derive(Debug, Default)]
pub struct DnsCache {
    state: Mutex<DnsState>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `ip` unless it is already resolved, queued or in flight.
    pub fn enqueue(&self, ip: IpAddr) -> bool {
        let mut state = self.state.lock();
        if state.resolved.contains_key(&ip) || !state.pending.insert(ip) {
            return false;
        }
        state.queue.push_back(ip);
        true
    }

    /// Pop up to `max` queued addresses. Entries that were resolved in the
    /// meantime still count toward `max` but are not returned.
    pub fn take_pending(&self, max: usize) -> Vec<IpAddr> {
        let mut state = self.state.lock();
        let mut batch = Vec::with_capacity(max);
        for _ in 0..max {
            let Some(ip) = state.queue.pop_front() else { break };
            if state.resolved.contains_key(&ip) {
                state.pending.remove(&ip);
                continue;
            }
            batch.push(ip);
        }
        batch
    }

    /// Store a lookup outcome. The first outcome for an address sticks.
    pub fn record(&self, ip: IpAddr, hostname: Option<String>) {
        let mut state = self.state.lock();
        state.pending.remove(&ip);
        state.resolved.entry(ip).or_insert(hostname);
    }

    pub fn hostname(&self, ip: &IpAddr) -> Option<String> {
        self.state.lock().resolved.get(ip).cloned().flatten()
    }

    pub fn is_resolved(&self, ip: &IpAddr) -> bool {
        self.state.lock().resolved.contains_key(ip)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<String, Option<String>> {
        self.state
            .lock()
            .resolved
            .iter()
            .map(|(ip, name)| (ip.to_string(), name.clone()))
            .collect()
    }
}

/// Resolve one tick's worth of queued addresses concurrently.
pub async fn resolve_pending(
    cache: &DnsCache,
    resolver: &Arc<dyn ReverseResolver>,
    max: usize,
    timeout: Duration,
) -> usize {
    let batch = cache.take_pending(max);
    if batch.is_empty() {
        return 0;
    }

    let lookups = batch.into_iter().map(|ip| {
        let resolver = Arc::clone(resolver);
        async move {
            let lookup = tokio::task::spawn_blocking(move || resolver.reverse(ip));
            let hostname = match time::timeout(timeout, lookup).await {
                Ok(Ok(hostname)) => hostname,
                Ok(Err(e)) => {
                    warn!(%ip, error = %e, "reverse lookup task failed");
                    None
                }
                Err(_) => {
                    debug!(%ip, "reverse lookup timed out");
                    None
                }
            };
            (ip, hostname)
        }
    });

    let results = join_all(lookups).await;
    let count = results.len();
    for (ip, hostname) in results {
        if let Some(name) = &hostname {
            debug!(%ip, hostname = %name, "resolved");
        }
        cache.record(ip, hostname);
    }
    count
}

pub fn spawn_worker(
    runtime: &Handle,
    cache: Arc<DnsCache>,
    resolver: Arc<dyn ReverseResolver>,
    running: Arc<AtomicBool>,
    tuning: DnsTuning,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let period = tuning.tick();
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        // a slow round delays the next one instead of bursting to catch up
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !running.load(Ordering::SeqCst) {
                break;
            }
            resolve_pending(&cache, &resolver, tuning.per_tick, tuning.timeout()).await;
        }
        debug!("dns worker stopped");
    })
}

/// Drain the whole queue from synchronous code, `per_round` lookups at a time.
pub fn resolve_all_blocking(cache: &DnsCache, resolver: &Arc<dyn ReverseResolver>, per_round: usize, timeout: Duration) {
    loop {
        let batch = cache.take_pending(per_round.max(1));
        if batch.is_empty() {
            break;
        }

        let deadline = Instant::now() + timeout;
        let lookups: Vec<_> = batch
            .into_iter()
            .map(|ip| {
                let (tx, rx) = crossbeam_channel::bounded(1);
                let resolver = Arc::clone(resolver);
                // a lookup that overruns the deadline is left to finish on its own
                thread::spawn(move || {
                    let _ = tx.send(resolver.reverse(ip));
                });
                (ip, rx)
            })
            .collect();

        for (ip, rx) in lookups {
            let hostname = rx.recv_deadline(deadline).unwrap_or_else(|_| {
                debug!(%ip, "reverse lookup timed out");
                None
            });
            cache.record(ip, hostname);
        }
    }
}
