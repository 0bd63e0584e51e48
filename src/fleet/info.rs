//! Endpoint probe contract
//!
//! Every fleet member answers a single unary `Info` call describing its
//! component kind, covered time range, advertised external label sets and
//! capability sub-sections. The transport is tonic; the wire structs are
//! prost messages and the unary client is written directly against
//! `tonic::client::Grpc` since this is the only method the fleet consumes.

use crate::labels::LabelSet;
use crate::{Error, Result};

use async_trait::async_trait;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

/// Full method path of the info probe.
pub const INFO_METHOD_PATH: &str = "/flotilla.info.Info/Info";

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRequest {}

/// Store sub-capability: the time range an endpoint can serve series for.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StoreInfo {
    #[prost(int64, tag = "1")]
    pub min_time: i64,
    #[prost(int64, tag = "2")]
    pub max_time: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RulesInfo {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TargetsInfo {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricMetadataInfo {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExemplarsInfo {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryInfo {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbLabel {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbLabelSet {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<PbLabel>,
}

impl PbLabelSet {
    pub fn to_label_set(&self) -> LabelSet {
        self.labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }

    pub fn from_label_set(set: &LabelSet) -> Self {
        Self {
            labels: set
                .iter()
                .map(|(name, value)| PbLabel {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }
}

/// Response of the info probe. The presence of a capability sub-section is
/// the authoritative signal that the endpoint serves that API.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoResponse {
    #[prost(message, repeated, tag = "1")]
    pub label_sets: Vec<PbLabelSet>,
    /// Lowercase component kind, e.g. `sidecar`
    #[prost(string, tag = "2")]
    pub component_type: String,
    #[prost(message, optional, tag = "3")]
    pub store: Option<StoreInfo>,
    #[prost(message, optional, tag = "4")]
    pub rules: Option<RulesInfo>,
    #[prost(message, optional, tag = "5")]
    pub metric_metadata: Option<MetricMetadataInfo>,
    #[prost(message, optional, tag = "6")]
    pub targets: Option<TargetsInfo>,
    #[prost(message, optional, tag = "7")]
    pub exemplars: Option<ExemplarsInfo>,
    #[prost(message, optional, tag = "8")]
    pub query: Option<QueryInfo>,
}

/// The capability set of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub store: bool,
    pub rules: bool,
    pub targets: bool,
    pub metric_metadata: bool,
    pub exemplars: bool,
    pub query: bool,
}

impl Capabilities {
    fn any(&self) -> bool {
        self.store
            || self.rules
            || self.targets
            || self.metric_metadata
            || self.exemplars
            || self.query
    }
}

/// Recognized component kinds. Unknown kinds carry no default capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Sidecar,
    Query,
    Receive,
    Rule,
    Store,
}

impl ComponentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sidecar" => Some(Self::Sidecar),
            "query" => Some(Self::Query),
            "receive" => Some(Self::Receive),
            "rule" => Some(Self::Rule),
            "store" => Some(Self::Store),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sidecar => "sidecar",
            Self::Query => "query",
            Self::Receive => "receive",
            Self::Rule => "rule",
            Self::Store => "store",
        }
    }

    /// Default capabilities assumed for endpoints whose info response omits
    /// every capability sub-section.
    pub fn default_capabilities(&self) -> Capabilities {
        match self {
            Self::Sidecar => Capabilities {
                store: true,
                rules: true,
                targets: true,
                metric_metadata: true,
                exemplars: true,
                query: false,
            },
            Self::Query => Capabilities {
                store: true,
                rules: true,
                targets: true,
                metric_metadata: true,
                exemplars: true,
                query: true,
            },
            Self::Receive => Capabilities {
                store: true,
                rules: false,
                targets: false,
                metric_metadata: false,
                exemplars: true,
                query: false,
            },
            Self::Rule => Capabilities {
                store: true,
                rules: true,
                targets: false,
                metric_metadata: false,
                exemplars: false,
                query: false,
            },
            Self::Store => Capabilities {
                store: true,
                rules: false,
                targets: false,
                metric_metadata: false,
                exemplars: false,
                query: false,
            },
        }
    }
}

impl InfoResponse {
    /// Capabilities advertised by this response. Sub-section presence wins;
    /// the kind table only applies when no sub-section is present at all.
    pub fn capabilities(&self) -> Capabilities {
        let explicit = Capabilities {
            store: self.store.is_some(),
            rules: self.rules.is_some(),
            targets: self.targets.is_some(),
            metric_metadata: self.metric_metadata.is_some(),
            exemplars: self.exemplars.is_some(),
            query: self.query.is_some(),
        };
        if explicit.any() {
            return explicit;
        }
        ComponentKind::parse(&self.component_type)
            .map(|k| k.default_capabilities())
            .unwrap_or_default()
    }
}

/// Client side of the info probe.
#[async_trait]
pub trait InfoClient: Send + Sync {
    async fn info(&self, request: InfoRequest) -> Result<InfoResponse>;
}

/// Establishes connections for endpoint specs.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, spec: &EndpointSpec) -> Result<Box<dyn InfoClient>>;
}

/// Connection knobs carried by an endpoint spec.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub connect_timeout: Option<Duration>,
}

/// One discovered endpoint: address, strictness and dial options. Strict
/// endpoints are statically configured and never evicted from membership.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub addr: String,
    pub strict: bool,
    pub dial_options: DialOptions,
}

impl EndpointSpec {
    pub fn new(addr: impl Into<String>, strict: bool) -> Self {
        Self {
            addr: addr.into(),
            strict,
            dial_options: DialOptions::default(),
        }
    }

    pub fn with_dial_options(mut self, options: DialOptions) -> Self {
        self.dial_options = options;
        self
    }
}

/// Info client over a tonic channel.
#[derive(Clone)]
pub struct GrpcInfoClient {
    channel: Channel,
}

impl GrpcInfoClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl InfoClient for GrpcInfoClient {
    async fn info(&self, request: InfoRequest) -> Result<InfoResponse> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::Transport(format!("endpoint not ready: {e}")))?;
        let codec: ProstCodec<InfoRequest, InfoResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(INFO_METHOD_PATH);
        let response = grpc
            .unary(tonic::Request::new(request), path, codec)
            .await
            .map_err(|status| Error::Transport(status.to_string()))?;
        Ok(response.into_inner())
    }
}

/// Production dialer: lazy tonic channels, so establishment cost is paid on
/// first probe and dial itself cannot block an update.
pub struct GrpcDialer;

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(&self, spec: &EndpointSpec) -> Result<Box<dyn InfoClient>> {
        let uri = if spec.addr.contains("://") {
            spec.addr.clone()
        } else {
            format!("http://{}", spec.addr)
        };
        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::Transport(format!("invalid endpoint address {}: {e}", spec.addr)))?;
        if let Some(timeout) = spec.dial_options.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        Ok(Box::new(GrpcInfoClient::new(endpoint.connect_lazy())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_for(kind: &str) -> InfoResponse {
        let mut resp = InfoResponse {
            component_type: kind.to_string(),
            store: Some(StoreInfo {
                min_time: i64::MIN,
                max_time: i64::MAX,
            }),
            ..Default::default()
        };
        match kind {
            "sidecar" => {
                resp.rules = Some(RulesInfo {});
                resp.targets = Some(TargetsInfo {});
                resp.metric_metadata = Some(MetricMetadataInfo {});
                resp.exemplars = Some(ExemplarsInfo {});
            }
            "query" => {
                resp.rules = Some(RulesInfo {});
                resp.targets = Some(TargetsInfo {});
                resp.metric_metadata = Some(MetricMetadataInfo {});
                resp.exemplars = Some(ExemplarsInfo {});
                resp.query = Some(QueryInfo {});
            }
            "receive" => resp.exemplars = Some(ExemplarsInfo {}),
            "rule" => resp.rules = Some(RulesInfo {}),
            _ => {}
        }
        resp
    }

    #[test]
    fn test_subsection_presence_is_authoritative() {
        for kind in ["sidecar", "query", "receive", "rule", "store"] {
            let caps = response_for(kind).capabilities();
            let expected = ComponentKind::parse(kind).unwrap().default_capabilities();
            assert_eq!(caps, expected, "kind {kind}");
        }
    }

    #[test]
    fn test_kind_fallback_when_no_subsections() {
        let resp = InfoResponse {
            component_type: "rule".to_string(),
            ..Default::default()
        };
        let caps = resp.capabilities();
        assert!(caps.store);
        assert!(caps.rules);
        assert!(!caps.targets);
    }

    #[test]
    fn test_unknown_kind_has_no_capabilities() {
        let resp = InfoResponse {
            component_type: "debug-proxy".to_string(),
            ..Default::default()
        };
        assert_eq!(resp.capabilities(), Capabilities::default());
    }

    #[test]
    fn test_lost_capability_reflected() {
        // A later probe without the rules section revokes the capability.
        let mut resp = response_for("sidecar");
        resp.rules = None;
        assert!(!resp.capabilities().rules);
        assert!(resp.capabilities().store);
    }

    #[test]
    fn test_label_set_conversion_sorts_by_name() {
        let pb = PbLabelSet {
            labels: vec![
                PbLabel {
                    name: "zone".into(),
                    value: "b".into(),
                },
                PbLabel {
                    name: "az".into(),
                    value: "a".into(),
                },
            ],
        };
        assert_eq!(pb.to_label_set().to_string(), r#"{az="a", zone="b"}"#);
    }
}
