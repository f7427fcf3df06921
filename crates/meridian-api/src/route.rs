//! Route configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    listener::FilterOverride, matcher::HeaderMatcher, Duration, FractionalPercent, Regex,
};

/// Filter overrides keyed by HTTP filter name.
pub type FilterOverrides = BTreeMap<String, FilterOverride>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

impl RouteConfig {
    /// The name of every cluster any route in this config can send traffic
    /// to.
    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.virtual_hosts
            .iter()
            .flat_map(|vhost| vhost.routes.iter())
            .flat_map(|route| match &route.action {
                RouteAction::Forward(action) => action.target.cluster_names().collect(),
                RouteAction::NonForwarding => vec![],
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter_overrides: FilterOverrides,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub matcher: RouteMatch,
    pub action: RouteAction,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter_overrides: FilterOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    pub path: PathMatch,

    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,

    /// Match only a fraction of requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<FractionalPercent>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PathMatch {
    Prefix(String),
    Exact(String),
    Regex(Regex),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RouteAction {
    Forward(ForwardAction),

    /// A route that matches but can't be used by a client. Requests that
    /// match a non-forwarding route fail.
    NonForwarding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardAction {
    pub target: ClusterTarget,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_policies: Vec<HashPolicy>,

    /// The maximum duration of a request, overriding the listener's max
    /// stream duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ClusterTarget {
    Cluster(String),
    Weighted(Vec<WeightedCluster>),
}

impl ClusterTarget {
    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        let names: Vec<&str> = match self {
            ClusterTarget::Cluster(name) => vec![name],
            ClusterTarget::Weighted(clusters) => clusters.iter().map(|c| c.name.as_str()).collect(),
        };
        names.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter_overrides: FilterOverrides,
}

/// Compute a request hash for ring hash load balancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashPolicy {
    pub kind: HashPolicyKind,

    /// Stop evaluating hash policies after this one if it produces a hash.
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HashPolicyKind {
    Header {
        name: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        rewrite: Option<RegexRewrite>,
    },
    QueryParameter {
        name: String,
    },

    /// Hash a random value fixed per client channel.
    ChannelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexRewrite {
    pub pattern: Regex,
    pub substitution: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// gRPC status codes that may be retried.
    pub retry_on: Vec<i32>,
    pub num_retries: u32,
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: vec![],
            num_retries: 1,
            base_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(250),
        }
    }
}
