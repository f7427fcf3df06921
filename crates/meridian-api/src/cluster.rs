//! Cluster configuration.

use serde::{Deserialize, Serialize};

use crate::matcher::StringMatcher;

/// The default circuit breaker threshold for in-flight requests.
pub const DEFAULT_MAX_REQUESTS: u32 = 1024;

/// A cluster: how to discover its endpoints and how to balance load across
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,

    pub kind: ClusterKind,

    #[serde(default)]
    pub lb_policy: LbPolicy,

    /// The maximum number of concurrent requests to this cluster.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Report load for this cluster to the same server that served it.
    #[serde(default)]
    pub lrs_report_to_self: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_tls: Option<UpstreamTls>,
}

fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS
}

impl Cluster {
    /// The name used to subscribe to this cluster's endpoints. Only
    /// meaningful for EDS clusters.
    pub fn eds_service_name(&self) -> &str {
        match &self.kind {
            ClusterKind::Eds {
                service_name: Some(name),
            } => name,
            _ => &self.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterKind {
    /// Endpoints are discovered with a separate endpoint subscription.
    Eds {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
    },

    /// An ordered list of other clusters. Earlier clusters take priority.
    Aggregate { clusters: Vec<String> },

    /// Endpoints come from resolving a single DNS name.
    LogicalDns { hostname: String, port: u16 },
}

/// The default minimum ring size for ring hash load balancing.
pub const DEFAULT_MIN_RING_SIZE: u64 = 1024;

/// The default maximum ring size for ring hash load balancing.
pub const DEFAULT_MAX_RING_SIZE: u64 = 8 * 1024 * 1024;

/// The largest ring size that can be configured.
pub const MAX_RING_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    RingHash(RingHashConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingHashConfig {
    pub min_ring_size: u64,
    pub max_ring_size: u64,
}

impl Default for RingHashConfig {
    fn default() -> Self {
        Self {
            min_ring_size: DEFAULT_MIN_RING_SIZE,
            max_ring_size: DEFAULT_MAX_RING_SIZE,
        }
    }
}

/// TLS settings for connecting to a cluster's endpoints. Certificates are
/// referenced by certificate provider instance name and loaded elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamTls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_provider: Option<CertificateProviderInstance>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_provider: Option<CertificateProviderInstance>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_alt_name_matchers: Vec<StringMatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateProviderInstance {
    pub instance_name: String,

    #[serde(default)]
    pub certificate_name: String,
}
