//! Per-endpoint state
//!
//! An [`EndpointRef`] owns one fleet member's connection handle, its last
//! known probe metadata and its health status. Metadata is never cleared
//! once populated: a failing endpoint keeps answering capability queries
//! from its last successful probe until it is evicted.

use crate::fleet::info::{
    Capabilities, EndpointSpec, InfoClient, InfoRequest, InfoResponse, StoreInfo,
};
use crate::labels::{canonicalize_label_sets, LabelSet};
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Last successful (or synthesized) probe response plus the canonical form
/// of the advertised external label sets: empty sets dropped, duplicates
/// removed, deterministic order.
#[derive(Clone, PartialEq)]
pub struct EndpointMetadata {
    pub info: InfoResponse,
    pub label_sets: Vec<LabelSet>,
}

impl EndpointMetadata {
    pub fn new(info: InfoResponse) -> Self {
        let label_sets =
            canonicalize_label_sets(info.label_sets.iter().map(|s| s.to_label_set()).collect());
        Self { info, label_sets }
    }

    /// Placeholder for strict endpoints that never answered a probe: covers
    /// the widest representable time range so the endpoint still receives
    /// queries.
    fn cover_all() -> Self {
        Self::new(InfoResponse {
            store: Some(StoreInfo {
                min_time: i64::MIN,
                max_time: i64::MAX,
            }),
            ..Default::default()
        })
    }
}

struct EndpointState {
    metadata: Option<EndpointMetadata>,
    last_check: DateTime<Utc>,
    last_error: Option<String>,
}

/// One fleet member: address, connection handle, latest metadata, status.
///
/// The connection handle is owned exclusively by this ref; dropping the ref
/// (eviction) releases it.
pub struct EndpointRef {
    addr: String,
    strict: bool,
    client: Arc<dyn InfoClient>,
    state: RwLock<EndpointState>,
}

impl EndpointRef {
    pub(crate) fn new(
        spec: &EndpointSpec,
        client: Box<dyn InfoClient>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            addr: spec.addr.clone(),
            strict: spec.strict,
            client: Arc::from(client),
            state: RwLock::new(EndpointState {
                metadata: None,
                last_check: now,
                last_error: None,
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Run one info probe under `timeout` and fold the outcome into the
    /// ref's state.
    pub(crate) async fn probe(&self, timeout: Duration, now: DateTime<Utc>) {
        let result = match tokio::time::timeout(timeout, self.client.info(InfoRequest::default()))
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        };
        self.apply_probe_result(now, result);
    }

    pub(crate) fn apply_probe_result(&self, now: DateTime<Utc>, result: Result<InfoResponse>) {
        let mut state = self.state.write().unwrap();
        match result {
            Ok(response) => {
                state.metadata = Some(EndpointMetadata::new(response));
                state.last_error = None;
                state.last_check = now;
            }
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "info probe failed");
                if state.metadata.is_none() && self.strict {
                    warn!(
                        addr = %self.addr,
                        "strict endpoint never responded, assuming it covers the full time range"
                    );
                    state.metadata = Some(EndpointMetadata::cover_all());
                }
                // The first failure after a healthy probe refreshes the
                // liveness timestamp; repeated failures do not, so the
                // retention clock runs from the moment health was lost.
                if state.last_error.is_none() {
                    state.last_check = now;
                }
                state.last_error = Some(e.to_string());
            }
        }
    }

    /// Whether any probe ever populated metadata. Refs without metadata are
    /// pending eviction and invisible to query routing.
    pub fn has_metadata(&self) -> bool {
        self.state.read().unwrap().metadata.is_some()
    }

    pub fn metadata(&self) -> Option<EndpointMetadata> {
        self.state.read().unwrap().metadata.clone()
    }

    pub fn last_check(&self) -> DateTime<Utc> {
        self.state.read().unwrap().last_check
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().unwrap().last_error.clone()
    }

    /// Canonical external label sets from the latest metadata.
    pub fn label_sets(&self) -> Vec<LabelSet> {
        self.state
            .read()
            .unwrap()
            .metadata
            .as_ref()
            .map(|m| m.label_sets.clone())
            .unwrap_or_default()
    }

    /// Component kind string from the latest metadata, if any.
    pub fn component_type(&self) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .metadata
            .as_ref()
            .map(|m| m.info.component_type.clone())
    }

    /// Store time range from the latest metadata.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        self.state
            .read()
            .unwrap()
            .metadata
            .as_ref()
            .and_then(|m| m.info.store.as_ref())
            .map(|s| (s.min_time, s.max_time))
    }

    fn capabilities(&self) -> Capabilities {
        self.state
            .read()
            .unwrap()
            .metadata
            .as_ref()
            .map(|m| m.info.capabilities())
            .unwrap_or_default()
    }

    pub fn has_store_api(&self) -> bool {
        self.capabilities().store
    }

    pub fn has_rules_api(&self) -> bool {
        self.capabilities().rules
    }

    pub fn has_targets_api(&self) -> bool {
        self.capabilities().targets
    }

    pub fn has_metric_metadata_api(&self) -> bool {
        self.capabilities().metric_metadata
    }

    pub fn has_exemplars_api(&self) -> bool {
        self.capabilities().exemplars
    }

    pub fn has_query_api(&self) -> bool {
        self.capabilities().query
    }

    /// Snapshot for status listings. The last error is rendered as its
    /// display string so structured output never collapses an error into an
    /// empty document.
    pub fn status(&self) -> EndpointStatus {
        let state = self.state.read().unwrap();
        let (min_time, max_time) = state
            .metadata
            .as_ref()
            .and_then(|m| m.info.store.as_ref())
            .map(|s| (Some(s.min_time), Some(s.max_time)))
            .unwrap_or((None, None));
        EndpointStatus {
            name: self.addr.clone(),
            strict: self.strict,
            last_check: state.last_check,
            last_error: state.last_error.clone(),
            component_type: state.metadata.as_ref().map(|m| m.info.component_type.clone()),
            label_sets: state
                .metadata
                .as_ref()
                .map(|m| m.label_sets.clone())
                .unwrap_or_default(),
            min_time,
            max_time,
        }
    }
}

/// Point-in-time view of one membership entry.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub strict: bool,
    pub last_check: DateTime<Utc>,
    pub last_error: Option<String>,
    pub component_type: Option<String>,
    pub label_sets: Vec<LabelSet>,
    pub min_time: Option<i64>,
    pub max_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::info::{ExemplarsInfo, RulesInfo};
    use async_trait::async_trait;

    struct NeverClient;

    #[async_trait]
    impl InfoClient for NeverClient {
        async fn info(&self, _request: InfoRequest) -> Result<InfoResponse> {
            Err(Error::Transport("unused".to_string()))
        }
    }

    fn make_ref(strict: bool) -> EndpointRef {
        EndpointRef::new(
            &EndpointSpec::new("127.0.0.1:10901", strict),
            Box::new(NeverClient),
            Utc::now(),
        )
    }

    fn sidecar_response() -> InfoResponse {
        InfoResponse {
            component_type: "sidecar".to_string(),
            store: Some(StoreInfo {
                min_time: 111,
                max_time: 222,
            }),
            rules: Some(RulesInfo {}),
            exemplars: Some(ExemplarsInfo {}),
            ..Default::default()
        }
    }

    #[test]
    fn test_metadata_retained_across_failures() {
        let er = make_ref(false);
        let now = Utc::now();

        er.apply_probe_result(now, Ok(sidecar_response()));
        assert_eq!(er.time_range(), Some((111, 222)));
        assert!(er.last_error().is_none());

        er.apply_probe_result(now, Err(Error::Transport("conn refused".to_string())));
        assert_eq!(er.time_range(), Some((111, 222)));
        assert!(er.last_error().is_some());
    }

    #[test]
    fn test_success_clears_previous_error() {
        let er = make_ref(false);
        let now = Utc::now();

        er.apply_probe_result(now, Err(Error::Timeout));
        assert!(er.last_error().is_some());

        er.apply_probe_result(now, Ok(sidecar_response()));
        assert!(er.last_error().is_none());
    }

    #[test]
    fn test_strict_failure_synthesizes_cover_all() {
        let er = make_ref(true);
        er.apply_probe_result(Utc::now(), Err(Error::Timeout));
        assert!(er.has_metadata());
        assert_eq!(er.time_range(), Some((i64::MIN, i64::MAX)));
        assert!(er.has_store_api());
    }

    #[test]
    fn test_non_strict_failure_stays_bare() {
        let er = make_ref(false);
        er.apply_probe_result(Utc::now(), Err(Error::Timeout));
        assert!(!er.has_metadata());
        assert!(!er.has_store_api());
    }

    #[test]
    fn test_repeated_failures_freeze_last_check() {
        let er = make_ref(false);
        let t0 = Utc::now();
        er.apply_probe_result(t0, Ok(sidecar_response()));

        let t1 = t0 + chrono::Duration::seconds(30);
        er.apply_probe_result(t1, Err(Error::Timeout));
        assert_eq!(er.last_check(), t1);

        let t2 = t1 + chrono::Duration::seconds(30);
        er.apply_probe_result(t2, Err(Error::Timeout));
        assert_eq!(er.last_check(), t1);
    }

    #[test]
    fn test_capability_queries_follow_latest_metadata() {
        let er = make_ref(false);
        let now = Utc::now();
        er.apply_probe_result(now, Ok(sidecar_response()));
        assert!(er.has_rules_api());

        // Next probe no longer advertises rules.
        let mut downgraded = sidecar_response();
        downgraded.rules = None;
        er.apply_probe_result(now, Ok(downgraded));
        assert!(!er.has_rules_api());
        assert!(er.has_store_api());
    }

    #[test]
    fn test_status_serializes_error_as_string() {
        let er = make_ref(false);
        er.apply_probe_result(Utc::now(), Err(Error::Transport("boom".to_string())));
        let json = serde_json::to_value(er.status()).unwrap();
        assert_eq!(json["last_error"], serde_json::json!("Transport error: boom"));
    }
}
