//! Client-side listeners and their HTTP filter chains.

use serde::{Deserialize, Serialize};

use crate::{fault::FaultConfig, rbac::RbacConfig, route::RouteConfig, Duration};

/// A client listener. Clients only use listeners with an API listener
/// wrapping an HTTP connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub http_connection_manager: HttpConnectionManager,
}

impl Listener {
    /// The name of the route configuration this listener depends on, if it
    /// isn't inlined.
    pub fn route_config_name(&self) -> Option<&str> {
        match &self.http_connection_manager.route_config {
            RouteSource::Rds { name } => Some(name),
            RouteSource::Inline(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConnectionManager {
    pub route_config: RouteSource,

    /// HTTP filters in the order they run. The last filter is always the
    /// router.
    pub http_filters: Vec<HttpFilter>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stream_duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RouteSource {
    Rds { name: String },
    Inline(RouteConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpFilter {
    pub name: String,
    pub config: FilterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterConfig {
    Router,
    Fault(FaultConfig),
    Rbac(RbacConfig),
}

/// A per-route replacement for a listener-level filter config, keyed by
/// filter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterOverride {
    Fault(FaultConfig),
    Rbac(RbacConfig),

    /// Disable the filter for this route.
    Disabled,
}
