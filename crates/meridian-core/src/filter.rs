//! HTTP filters.
//!
//! A listener's HTTP connection manager lists the filters every call runs
//! through. Routes can replace a filter's config or disable it entirely.
//! [FilterChain] resolves those overrides for a single call and runs the
//! filters in order.

use std::{net::SocketAddr, time::Instant};

use meridian_api::{
    fault::FaultConfig,
    listener::{FilterConfig, FilterOverride, HttpConnectionManager},
    rbac::RbacConfig,
};

use crate::route::SelectedRoute;

pub mod fault;
pub mod rbac;

/// Everything filters know about a call.
#[derive(Debug, Clone, Copy)]
pub struct CallAttributes<'a> {
    pub method: &'a str,
    pub authority: &'a str,

    /// The `:path` of the call, including the query string if any.
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,

    /// The local address of the connection the call is sent on.
    pub local_addr: Option<SocketAddr>,

    /// The address of the peer the call is sent to.
    pub peer_addr: Option<SocketAddr>,

    /// The peer's verified identities, or `None` if the connection isn't
    /// authenticated.
    pub peer_identities: Option<&'a [String]>,

    /// The SNI sent when the connection was established.
    pub requested_server_name: Option<&'a str>,
}

impl<'a> CallAttributes<'a> {
    pub(crate) fn path_only(&self) -> &'a str {
        match self.path.split_once('?') {
            Some((path, _)) => path,
            None => self.path,
        }
    }
}

/// A filter with its effective config for a single call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveFilter<'a> {
    Fault(&'a FaultConfig),
    Rbac(&'a RbacConfig),
}

/// The filters that run for a single call, in order.
#[derive(Debug, Clone, Default)]
pub struct FilterChain<'a> {
    filters: Vec<(&'a str, ActiveFilter<'a>)>,
}

/// Per-call state held by filters until the call completes.
#[derive(Debug, Default)]
pub struct CallGuard {
    _faults: Vec<fault::FaultDecision>,
}

impl<'a> FilterChain<'a> {
    /// Build the chain for a routed call.
    ///
    /// Overrides are looked up by filter name. An override of the wrong kind
    /// for a filter is ignored. The router filter doesn't run anything.
    pub fn for_route(hcm: &'a HttpConnectionManager, route: &SelectedRoute<'a>) -> Self {
        let mut filters = Vec::with_capacity(hcm.http_filters.len());

        for filter in &hcm.http_filters {
            let name = filter.name.as_str();
            let active = match (&filter.config, route.filter_override(name)) {
                (FilterConfig::Router, _) => continue,
                (_, Some(FilterOverride::Disabled)) => continue,
                (FilterConfig::Fault(_), Some(FilterOverride::Fault(config))) => {
                    ActiveFilter::Fault(config)
                }
                (FilterConfig::Rbac(_), Some(FilterOverride::Rbac(config))) => {
                    ActiveFilter::Rbac(config)
                }
                (FilterConfig::Fault(config), _) => ActiveFilter::Fault(config),
                (FilterConfig::Rbac(config), _) => ActiveFilter::Rbac(config),
            };
            filters.push((name, active));
        }

        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The filters in the chain and their effective configs.
    pub fn filters(&self) -> impl Iterator<Item = (&'a str, ActiveFilter<'a>)> + '_ {
        self.filters.iter().copied()
    }

    /// Run every filter for a call, stopping at the first one that fails
    /// the call.
    ///
    /// The returned guard must be held until the call completes.
    pub async fn run(
        &self,
        call: &CallAttributes<'_>,
        deadline: Option<Instant>,
    ) -> Result<CallGuard, tonic::Status> {
        let mut guard = CallGuard::default();

        for (name, filter) in &self.filters {
            match filter {
                ActiveFilter::Rbac(config) => {
                    let decision = rbac::evaluate(config, call);
                    if let rbac::RbacDecision::Deny { policy } = &decision {
                        tracing::debug!(filter = name, ?policy, path = call.path, "call denied");
                    }
                    decision.into_result()?;
                }
                ActiveFilter::Fault(config) => {
                    let decision = fault::decide(config, call.headers);
                    if decision.is_none() {
                        continue;
                    }
                    tracing::trace!(filter = name, ?decision, "injecting fault");
                    decision.apply(deadline).await?;
                    guard._faults.push(decision);
                }
            }
        }

        Ok(guard)
    }
}
