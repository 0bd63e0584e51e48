//! Endpoint fleet membership
//!
//! Tracks a dynamic set of remote query endpoints discovered through a
//! caller-supplied spec source. Each update fans out one bounded info probe
//! per address, then swaps membership atomically: readers observe either the
//! previous membership or the complete new one, never a half-applied view.
//!
//! Readers take a short read lock and receive snapshot vectors; probes run
//! outside any map lock against per-ref state, so an in-flight update never
//! starves queries.

pub mod endpoint;
pub mod info;
pub mod metrics;

pub use endpoint::{EndpointMetadata, EndpointRef, EndpointStatus};
pub use info::{
    Capabilities, ComponentKind, DialOptions, Dialer, EndpointSpec, GrpcDialer, GrpcInfoClient,
    InfoClient, InfoRequest, InfoResponse, StoreInfo,
};
pub use metrics::{EndpointStats, DEFAULT_LABEL_REPR_LIMIT};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type SpecSourceFn = Arc<dyn Fn() -> Vec<EndpointSpec> + Send + Sync>;

/// Endpoint set configuration
#[derive(Debug, Clone)]
pub struct EndpointSetConfig {
    /// How long a non-strict endpoint may stay unseen-healthy before it is
    /// evicted and its connection dropped
    pub unhealthy_timeout: Duration,
    /// Upper bound for one info probe
    pub info_timeout: Duration,
    /// Byte budget for serialized label-set stat keys
    pub label_repr_limit: usize,
}

impl Default for EndpointSetConfig {
    fn default() -> Self {
        Self {
            unhealthy_timeout: Duration::from_secs(5 * 60),
            info_timeout: Duration::from_secs(5),
            label_repr_limit: DEFAULT_LABEL_REPR_LIMIT,
        }
    }
}

/// Membership manager for a fleet of remote query endpoints.
pub struct EndpointSet {
    dialer: Arc<dyn Dialer>,
    spec_source: SpecSourceFn,
    config: EndpointSetConfig,
    now: NowFn,
    /// Serializes updates; never held across reader calls
    update_lock: tokio::sync::Mutex<()>,
    /// Address → ref. The write lock is taken only for the membership swap.
    endpoints: RwLock<HashMap<String, Arc<EndpointRef>>>,
    stats: RwLock<EndpointStats>,
    /// Latched by the first completed update
    initialized: CancellationToken,
}

impl EndpointSet {
    /// Create a new endpoint set. `spec_source` is consulted once per
    /// [`EndpointSet::update`]; duplicate addresses collapse to their first
    /// occurrence.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        spec_source: impl Fn() -> Vec<EndpointSpec> + Send + Sync + 'static,
        config: EndpointSetConfig,
    ) -> Self {
        Self {
            dialer,
            spec_source: Arc::new(spec_source),
            config,
            now: Arc::new(Utc::now),
            update_lock: tokio::sync::Mutex::new(()),
            endpoints: RwLock::new(HashMap::new()),
            stats: RwLock::new(EndpointStats::new()),
            initialized: CancellationToken::new(),
        }
    }

    /// Replace the clock, letting tests drive retention arithmetic.
    pub fn with_now_fn(
        mut self,
        now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.now = Arc::new(now);
        self
    }

    /// Probe every currently discovered address and atomically update the
    /// membership.
    ///
    /// Reentrant-safe with respect to readers and serialized against itself.
    /// Dropping the returned future mid-probe discards the partial pass: no
    /// swap happens and new refs are abandoned before publication.
    pub async fn update(&self) {
        let _serialize = self.update_lock.lock().await;
        let now = (self.now)();

        let mut specs = Vec::new();
        let mut seen = HashSet::new();
        for spec in (self.spec_source)() {
            if seen.insert(spec.addr.clone()) {
                specs.push(spec);
            } else {
                debug!(addr = %spec.addr, "collapsing duplicate endpoint spec");
            }
        }

        // Reuse connections for known addresses; dial the rest eagerly.
        // Fresh refs stay private until the swap below.
        let existing: HashMap<String, Arc<EndpointRef>> =
            self.endpoints.read().unwrap().clone();
        let mut to_probe: Vec<Arc<EndpointRef>> = Vec::with_capacity(specs.len());
        let mut fresh: Vec<Arc<EndpointRef>> = Vec::new();
        for spec in &specs {
            if let Some(er) = existing.get(&spec.addr) {
                to_probe.push(er.clone());
                continue;
            }
            match self.dialer.dial(spec).await {
                Ok(client) => {
                    let er = Arc::new(EndpointRef::new(spec, client, now));
                    fresh.push(er.clone());
                    to_probe.push(er);
                }
                Err(e) => {
                    warn!(addr = %spec.addr, error = %e, "dialing new endpoint failed");
                }
            }
        }

        // Fan out probes in parallel and await every one of them before the
        // membership swap, so partial results never publish.
        let mut probes = JoinSet::new();
        for er in to_probe {
            let timeout = self.config.info_timeout;
            probes.spawn(async move { er.probe(timeout, now).await });
        }
        while probes.join_next().await.is_some() {}

        {
            let mut members = self.endpoints.write().unwrap();
            for er in fresh {
                members.insert(er.addr().to_string(), er);
            }

            // A ref's last_check refreshes on success and freezes at the
            // first failure, so this single age test evicts both endpoints
            // that left discovery and endpoints that keep failing.
            let horizon = now
                - chrono::Duration::from_std(self.config.unhealthy_timeout)
                    .unwrap_or_else(|_| chrono::Duration::max_value());
            members.retain(|addr, er| {
                if er.is_strict() {
                    return true;
                }
                if er.last_check() >= horizon {
                    return true;
                }
                info!(addr = %addr, "evicting endpoint past unhealthy retention");
                false
            });
        }

        self.rebuild_stats();
        self.initialized.cancel();
    }

    /// Block until the first [`EndpointSet::update`] has completed. Later
    /// completions do not re-arm the latch; callers bound the wait with
    /// `tokio::time::timeout`.
    pub async fn wait_for_first_update(&self) {
        self.initialized.cancelled().await;
    }

    /// Refs usable for query routing: every member with metadata, i.e. live
    /// endpoints, stale-but-previously-live endpoints and strict placeholders.
    pub fn get_store_clients(&self) -> Vec<Arc<EndpointRef>> {
        let mut refs: Vec<_> = self
            .endpoints
            .read()
            .unwrap()
            .values()
            .filter(|er| er.has_metadata())
            .cloned()
            .collect();
        refs.sort_by(|a, b| a.addr().cmp(b.addr()));
        refs
    }

    /// Status of every membership entry, including endpoints that never
    /// answered a probe and are pending eviction.
    pub fn get_endpoint_status(&self) -> Vec<EndpointStatus> {
        let mut statuses: Vec<_> = self
            .endpoints
            .read()
            .unwrap()
            .values()
            .map(|er| er.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn get_rules_clients(&self) -> Vec<Arc<EndpointRef>> {
        self.clients_with(|er| er.has_rules_api())
    }

    pub fn get_targets_clients(&self) -> Vec<Arc<EndpointRef>> {
        self.clients_with(|er| er.has_targets_api())
    }

    pub fn get_metric_metadata_clients(&self) -> Vec<Arc<EndpointRef>> {
        self.clients_with(|er| er.has_metric_metadata_api())
    }

    pub fn get_exemplars_clients(&self) -> Vec<Arc<EndpointRef>> {
        self.clients_with(|er| er.has_exemplars_api())
    }

    pub fn get_query_clients(&self) -> Vec<Arc<EndpointRef>> {
        self.clients_with(|er| er.has_query_api())
    }

    fn clients_with(&self, pred: impl Fn(&EndpointRef) -> bool) -> Vec<Arc<EndpointRef>> {
        let mut refs: Vec<_> = self
            .endpoints
            .read()
            .unwrap()
            .values()
            .filter(|er| er.has_metadata() && pred(er.as_ref()))
            .cloned()
            .collect();
        refs.sort_by(|a, b| a.addr().cmp(b.addr()));
        refs
    }

    /// Live endpoint counts grouped by kind × external labels, rebuilt on
    /// every update.
    pub fn stats(&self) -> EndpointStats {
        self.stats.read().unwrap().clone()
    }

    /// Drop the whole membership, releasing every connection handle.
    pub fn close(&self) {
        self.endpoints.write().unwrap().clear();
        *self.stats.write().unwrap() = EndpointStats::new();
    }

    fn rebuild_stats(&self) {
        let refs = self.get_store_clients();
        *self.stats.write().unwrap() =
            EndpointStats::rebuild(&refs, self.config.label_repr_limit);
    }
}
