use std::collections::BTreeSet;

use xds_api::pb::{
    envoy::{
        config::listener::v3 as xds_listener,
        extensions::filters::{
            http::{fault::v3::HttpFault, rbac::v3::Rbac, router::v3::Router},
            network::http_connection_manager::v3::{
                self as xds_hcm, http_connection_manager::RouteSpecifier,
                http_filter::ConfigType,
            },
        },
    },
    google::protobuf,
};

use crate::{
    error::{Error, ErrorContext},
    fault::FaultConfig,
    listener::{FilterConfig, HttpConnectionManager, HttpFilter, Listener, RouteSource},
    rbac::RbacConfig,
    route::RouteConfig,
    xds::{duration_from_xds, is_ads_or_self, is_type},
};

impl Listener {
    pub fn from_xds(xds: &xds_listener::Listener) -> Result<Self, Error> {
        let Some(api_listener) = &xds.api_listener else {
            return Err(Error::new_static("listener has no api_listener"));
        };

        let Some(any) = &api_listener.api_listener else {
            return Err(Error::new_static("missing api_listener config"))
                .with_fields("api_listener", "api_listener");
        };

        if !is_type::<xds_hcm::HttpConnectionManager>(any) {
            return Err(Error::new(format!(
                "unsupported api_listener type: {}",
                any.type_url
            )))
            .with_fields("api_listener", "api_listener");
        }

        let hcm = any
            .to_msg::<xds_hcm::HttpConnectionManager>()
            .map_err(|e| Error::new(format!("invalid HttpConnectionManager: {e}")))
            .with_fields("api_listener", "api_listener")?;

        let http_connection_manager = HttpConnectionManager::from_xds(&hcm)
            .with_fields("api_listener", "api_listener")?;

        Ok(Listener {
            name: xds.name.clone(),
            http_connection_manager,
        })
    }
}

impl HttpConnectionManager {
    pub fn from_xds(xds: &xds_hcm::HttpConnectionManager) -> Result<Self, Error> {
        let route_config = match &xds.route_specifier {
            Some(RouteSpecifier::Rds(rds)) => {
                let source_ok = rds.config_source.as_ref().is_some_and(is_ads_or_self);
                if !source_ok {
                    return Err(Error::new_static(
                        "route config source must be ADS or self",
                    ))
                    .with_fields("rds", "config_source");
                }
                RouteSource::Rds {
                    name: rds.route_config_name.clone(),
                }
            }
            Some(RouteSpecifier::RouteConfig(route_config)) => {
                RouteSource::Inline(RouteConfig::from_xds(route_config).with_field("route_config")?)
            }
            Some(_) => {
                return Err(Error::new_static("unsupported route specifier"));
            }
            None => return Err(Error::new_static("missing route specifier")),
        };

        let http_filters = http_filters_from_xds(&xds.http_filters).with_field("http_filters")?;

        let max_stream_duration = xds
            .common_http_protocol_options
            .as_ref()
            .and_then(|opts| opts.max_stream_duration.as_ref())
            .map(duration_from_xds)
            .transpose()
            .with_fields("common_http_protocol_options", "max_stream_duration")?;

        Ok(HttpConnectionManager {
            route_config,
            http_filters,
            max_stream_duration,
        })
    }
}

fn http_filters_from_xds(filters: &[xds_hcm::HttpFilter]) -> Result<Vec<HttpFilter>, Error> {
    let mut names = BTreeSet::new();
    let mut http_filters = Vec::with_capacity(filters.len());

    for (i, filter) in filters.iter().enumerate() {
        if filter.name.is_empty() {
            return Err(Error::new_static("filter name cannot be empty"))
                .with_field("name")
                .with_index(i);
        }
        if !names.insert(filter.name.as_str()) {
            return Err(Error::new(format!("duplicate filter name: {}", filter.name)))
                .with_field("name")
                .with_index(i);
        }

        let config = match &filter.config_type {
            Some(ConfigType::TypedConfig(any)) => filter_config_from_any(any)
                .with_field("typed_config")
                .with_index(i)?,
            Some(ConfigType::ConfigDiscovery(_)) => {
                return Err(Error::new_static("filter config discovery is not supported"))
                    .with_field("config_discovery")
                    .with_index(i)
            }
            None => None,
        };

        match config {
            Some(config) => http_filters.push(HttpFilter {
                name: filter.name.clone(),
                config,
            }),
            None if filter.is_optional => continue,
            None => {
                return Err(Error::new(format!(
                    "unsupported filter: {}",
                    filter.name
                )))
                .with_index(i)
            }
        }
    }

    // the router has to be the last filter and can't appear anywhere else
    match http_filters.last() {
        Some(f) if f.config == FilterConfig::Router => (),
        Some(_) => return Err(Error::new_static("the last filter must be the router")),
        None => return Err(Error::new_static("missing router filter")),
    }
    let routers = http_filters
        .iter()
        .filter(|f| f.config == FilterConfig::Router)
        .count();
    if routers > 1 {
        return Err(Error::new_static("the router must be the last filter"));
    }

    Ok(http_filters)
}

/// Parse a listener-level filter config. Returns `Ok(None)` for filter types
/// the client doesn't know about.
fn filter_config_from_any(any: &protobuf::Any) -> Result<Option<FilterConfig>, Error> {
    if is_type::<Router>(any) {
        return Ok(Some(FilterConfig::Router));
    }

    if is_type::<HttpFault>(any) {
        let fault = any
            .to_msg::<HttpFault>()
            .map_err(|e| Error::new(format!("invalid fault filter: {e}")))?;
        return Ok(Some(FilterConfig::Fault(FaultConfig::from_xds(&fault)?)));
    }

    if is_type::<Rbac>(any) {
        let rbac = any
            .to_msg::<Rbac>()
            .map_err(|e| Error::new(format!("invalid rbac filter: {e}")))?;
        return Ok(Some(FilterConfig::Rbac(RbacConfig::from_xds(&rbac)?)));
    }

    Ok(None)
}
