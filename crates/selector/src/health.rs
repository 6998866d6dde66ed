//! Per-node health feedback.
//!
//! Every node carries a score in `[0, 1]` that starts at `1.0`. Each outcome
//! decays the score toward `1.0` on success or toward `0.0` on failure:
//!
//! ```text
//! ok:  score = score * decay + (1 - decay)
//! err: score = score * decay
//! ```
//!
//! Nodes scoring below `unhealthy_threshold` are withheld from selection
//! until `probe_after` has passed since their last failure. The first
//! selection after that claims the probe by re-stamping the failure time, so
//! other callers keep skipping the node for another `probe_after` unless the
//! probe succeeds and lifts the score.
//!
//! Updates are lock-free compare-and-swap loops on the node's score, so
//! concurrent marks for the same node never lose an outcome.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const NEUTRAL_SCORE: f64 = 1.0;
const NO_FAILURE: u64 = 0;

/// Tuning for health scoring.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealthConfig {
    /// Weight kept from the previous score on every mark, in `[0, 1)`.
    pub decay: f64,
    /// Nodes scoring strictly below this are skipped.
    pub unhealthy_threshold: f64,
    /// How long an unhealthy node is skipped before it may be probed again.
    pub probe_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            decay: 0.5,
            unhealthy_threshold: 0.25,
            probe_after: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one node's health.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStats {
    /// Node address
    pub address: String,
    /// Current score
    pub score: f64,
    /// Successful calls since the last reset
    pub successes: u64,
    /// Failed calls since the last reset
    pub failures: u64,
}

#[derive(Debug)]
struct NodeHealth {
    score: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    /// Millis since the tracker epoch plus one; zero means never failed.
    last_failure: AtomicU64,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            score: AtomicU64::new(NEUTRAL_SCORE.to_bits()),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_failure: AtomicU64::new(NO_FAILURE),
        }
    }
}

impl NodeHealth {
    fn score(&self) -> f64 {
        f64::from_bits(self.score.load(Ordering::Acquire))
    }

    fn update(&self, apply: impl Fn(f64) -> f64) {
        // The closure never returns None, so this cannot fail.
        let _ = self
            .score
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(apply(f64::from_bits(bits)).clamp(0.0, 1.0).to_bits())
            });
    }
}

#[derive(Debug, Default)]
struct ServiceHealth {
    nodes: DashMap<String, Arc<NodeHealth>>,
    cursor: AtomicUsize,
}

/// Health state for every service a selector has seen.
#[derive(Debug)]
pub struct HealthTracker {
    config: HealthConfig,
    epoch: Instant,
    services: DashMap<String, Arc<ServiceHealth>>,
}

impl HealthTracker {
    /// Create an empty tracker.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            services: DashMap::new(),
        }
    }

    /// Scoring configuration.
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn service(&self, service: &str) -> Arc<ServiceHealth> {
        if let Some(existing) = self.services.get(service) {
            return existing.clone();
        }
        self.services
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    fn node(&self, service: &str, address: &str) -> Option<Arc<NodeHealth>> {
        self.services
            .get(service)
            .and_then(|health| health.nodes.get(address).map(|node| node.clone()))
    }

    fn millis_since_epoch(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX - 1)
    }

    /// Record a successful call to `address`.
    pub fn record_success(&self, service: &str, address: &str) {
        let node = self.service(service).nodes.entry(address.to_string()).or_default().clone();
        let decay = self.config.decay;

        node.update(|score| score.mul_add(decay, 1.0 - decay));
        node.successes.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a failed call to `address`.
    pub fn record_failure(&self, service: &str, address: &str) {
        let node = self.service(service).nodes.entry(address.to_string()).or_default().clone();
        let decay = self.config.decay;

        node.update(|score| score * decay);
        node.failures.fetch_add(1, Ordering::AcqRel);
        node.last_failure
            .store(self.millis_since_epoch() + 1, Ordering::Release);
    }

    /// Current score of a node; unknown nodes are neutral.
    pub fn score(&self, service: &str, address: &str) -> f64 {
        self.node(service, address)
            .map_or(NEUTRAL_SCORE, |node| node.score())
    }

    /// Whether a node may be handed out right now.
    ///
    /// For an unhealthy node past its cool-down this claims the probe; only
    /// one caller per `probe_after` window gets `true`.
    pub fn is_available(&self, service: &str, address: &str) -> bool {
        let Some(node) = self.node(service, address) else {
            return true;
        };

        if node.score() >= self.config.unhealthy_threshold {
            return true;
        }

        let stamp = node.last_failure.load(Ordering::Acquire);
        if stamp == NO_FAILURE {
            return true;
        }

        let now = self.millis_since_epoch();
        let since = now.saturating_sub(stamp - 1);
        if u128::from(since) < self.config.probe_after.as_millis() {
            return false;
        }

        node.last_failure
            .compare_exchange(stamp, now + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Advance and return the round-robin cursor of a service.
    pub fn next_cursor(&self, service: &str) -> usize {
        self.service(service).cursor.fetch_add(1, Ordering::AcqRel)
    }

    /// Drop health entries of `service` whose address is not in `live`.
    ///
    /// Cheap when nothing needs dropping: the entries are only scanned once
    /// the service tracks more nodes than `live`.
    pub fn prune<'a>(&self, service: &str, live: impl IntoIterator<Item = &'a str>) {
        let Some(health) = self.services.get(service).map(|h| h.clone()) else {
            return;
        };

        let live: HashSet<&str> = live.into_iter().collect();
        if health.nodes.len() <= live.len() {
            return;
        }

        health.nodes.retain(|address, _| live.contains(address.as_str()));
    }

    /// Forget everything about a service. Idempotent.
    pub fn reset(&self, service: &str) {
        self.services.remove(service);
    }

    /// Stats for every node of `service` that has seen traffic, sorted by address.
    pub fn snapshot(&self, service: &str) -> Vec<NodeStats> {
        let Some(health) = self.services.get(service).map(|h| h.clone()) else {
            return Vec::new();
        };

        let mut stats: Vec<NodeStats> = health
            .nodes
            .iter()
            .map(|entry| NodeStats {
                address: entry.key().clone(),
                score: entry.value().score(),
                successes: entry.value().successes.load(Ordering::Acquire),
                failures: entry.value().failures.load(Ordering::Acquire),
            })
            .collect();
        stats.sort_by(|a, b| a.address.cmp(&b.address));
        stats
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
