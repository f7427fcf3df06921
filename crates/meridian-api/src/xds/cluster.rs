use xds_api::pb::envoy::{
    config::{
        cluster::v3::{
            self as xds_cluster,
            cluster::{ring_hash_lb_config::HashFunction, ClusterDiscoveryType, DiscoveryType},
        },
        core::v3 as xds_core,
        endpoint::v3 as xds_endpoint,
    },
    extensions::{
        clusters::aggregate::v3::ClusterConfig as AggregateClusterConfig,
        transport_sockets::tls::v3::{
            common_tls_context::ValidationContextType, CertificateProviderPluginInstance,
            CertificateValidationContext, UpstreamTlsContext,
        },
    },
};

use crate::{
    cluster::{
        CertificateProviderInstance, Cluster, ClusterKind, LbPolicy, RingHashConfig, UpstreamTls,
        DEFAULT_MAX_REQUESTS, DEFAULT_MAX_RING_SIZE, DEFAULT_MIN_RING_SIZE, MAX_RING_SIZE,
    },
    error::{Error, ErrorContext},
    value_or_default,
    xds::{is_ads_or_self, is_self, is_type, string_matcher_from_xds},
};

/// The custom cluster type name for aggregate clusters.
const AGGREGATE_CLUSTER_TYPE: &str = "envoy.clusters.aggregate";

impl Cluster {
    pub fn from_xds(xds: &xds_cluster::Cluster) -> Result<Self, Error> {
        let kind = cluster_kind(xds)?;
        let lb_policy = LbPolicy::from_xds(xds)?;

        let max_requests = xds
            .circuit_breakers
            .as_ref()
            .and_then(|cb| {
                cb.thresholds
                    .iter()
                    .find(|t| t.priority == xds_core::RoutingPriority::Default as i32)
            })
            .map(|t| value_or_default!(t.max_requests, DEFAULT_MAX_REQUESTS))
            .unwrap_or(DEFAULT_MAX_REQUESTS);

        let lrs_report_to_self = match &xds.lrs_server {
            Some(source) if is_self(source) => true,
            Some(_) => {
                return Err(Error::new_static("lrs_server must be self")).with_field("lrs_server")
            }
            None => false,
        };

        let upstream_tls = match &xds.transport_socket {
            Some(socket) => UpstreamTls::from_xds(socket).with_field("transport_socket")?,
            None => None,
        };

        Ok(Cluster {
            name: xds.name.clone(),
            kind,
            lb_policy,
            max_requests,
            lrs_report_to_self,
            upstream_tls,
        })
    }
}

fn cluster_kind(xds: &xds_cluster::Cluster) -> Result<ClusterKind, Error> {
    match &xds.cluster_discovery_type {
        Some(ClusterDiscoveryType::Type(t)) => match DiscoveryType::try_from(*t) {
            Ok(DiscoveryType::Eds) => eds_kind(xds),
            Ok(DiscoveryType::LogicalDns) => logical_dns_kind(xds),
            _ => Err(Error::new(format!("unsupported discovery type: {t}"))).with_field("type"),
        },
        Some(ClusterDiscoveryType::ClusterType(custom)) => {
            if custom.name != AGGREGATE_CLUSTER_TYPE {
                return Err(Error::new(format!(
                    "unsupported custom cluster type: {}",
                    custom.name
                )))
                .with_fields("cluster_type", "name");
            }

            let config = custom
                .typed_config
                .as_ref()
                .filter(|any| is_type::<AggregateClusterConfig>(any))
                .ok_or_else(|| Error::new_static("missing aggregate cluster config"))
                .and_then(|any| {
                    any.to_msg::<AggregateClusterConfig>()
                        .map_err(|e| Error::new(format!("invalid aggregate cluster config: {e}")))
                })
                .with_fields("cluster_type", "typed_config")?;

            if config.clusters.is_empty() {
                return Err(Error::new_static("aggregate cluster list must not be empty"))
                    .with_fields("cluster_type", "typed_config");
            }

            Ok(ClusterKind::Aggregate {
                clusters: config.clusters,
            })
        }
        None => Err(Error::new_static("missing cluster discovery type")),
    }
}

fn eds_kind(xds: &xds_cluster::Cluster) -> Result<ClusterKind, Error> {
    let Some(eds_config) = &xds.eds_cluster_config else {
        return Err(Error::new_static("missing EDS config")).with_field("eds_cluster_config");
    };

    if !eds_config.eds_config.as_ref().is_some_and(is_ads_or_self) {
        return Err(Error::new_static("EDS config source must be ADS or self"))
            .with_fields("eds_cluster_config", "eds_config");
    }

    let service_name = match eds_config.service_name.as_str() {
        "" => None,
        name => Some(name.to_string()),
    };

    if service_name.is_none() && xds.name.starts_with("xdstp:") {
        return Err(Error::new_static(
            "service_name must be set for clusters with xdstp names",
        ))
        .with_fields("eds_cluster_config", "service_name");
    }

    Ok(ClusterKind::Eds { service_name })
}

fn logical_dns_kind(xds: &xds_cluster::Cluster) -> Result<ClusterKind, Error> {
    use xds_core::{address, socket_address::PortSpecifier};
    use xds_endpoint::lb_endpoint::HostIdentifier;

    let lb_endpoint = xds
        .load_assignment
        .as_ref()
        .and_then(|cla| match cla.endpoints.as_slice() {
            [locality] => match locality.lb_endpoints.as_slice() {
                [endpoint] => Some(endpoint),
                _ => None,
            },
            _ => None,
        })
        .ok_or_else(|| {
            Error::new_static("logical DNS clusters must have exactly one endpoint")
        })
        .with_field("load_assignment")?;

    let address = match &lb_endpoint.host_identifier {
        Some(HostIdentifier::Endpoint(e)) => e.address.as_ref(),
        _ => None,
    };

    let socket_address = match address.and_then(|a| a.address.as_ref()) {
        Some(address::Address::SocketAddress(sa)) => sa,
        _ => {
            return Err(Error::new_static("missing socket address"))
                .with_fields("load_assignment", "endpoints")
        }
    };

    if !socket_address.resolver_name.is_empty() {
        return Err(Error::new_static(
            "logical DNS clusters must not have a custom resolver name",
        ))
        .with_fields("load_assignment", "endpoints");
    }

    let port = match socket_address.port_specifier {
        Some(PortSpecifier::PortValue(port)) => u16::try_from(port).ok(),
        _ => None,
    };
    let Some(port) = port else {
        return Err(Error::new_static("invalid port")).with_fields("load_assignment", "endpoints");
    };

    if socket_address.address.is_empty() {
        return Err(Error::new_static("missing hostname"))
            .with_fields("load_assignment", "endpoints");
    }

    Ok(ClusterKind::LogicalDns {
        hostname: socket_address.address.clone(),
        port,
    })
}

impl LbPolicy {
    pub(crate) fn from_xds(xds: &xds_cluster::Cluster) -> Result<Self, Error> {
        use xds_cluster::cluster::{LbConfig, LbPolicy as XdsLbPolicy};

        match XdsLbPolicy::try_from(xds.lb_policy) {
            Ok(XdsLbPolicy::RoundRobin) => Ok(LbPolicy::RoundRobin),
            Ok(XdsLbPolicy::RingHash) => {
                let default_config = xds_cluster::cluster::RingHashLbConfig::default();
                let lb_config = match &xds.lb_config {
                    Some(LbConfig::RingHashLbConfig(config)) => config,
                    None => &default_config,
                    _ => {
                        return Err(Error::new_static(
                            "ring hash lb_policy has a mismatched lb_config",
                        ))
                        .with_field("lb_config")
                    }
                };

                RingHashConfig::from_xds(lb_config)
                    .map(LbPolicy::RingHash)
                    .with_fields("lb_config", "ring_hash_lb_config")
            }
            _ => Err(Error::new(format!("unsupported lb policy: {}", xds.lb_policy)))
                .with_field("lb_policy"),
        }
    }
}

impl RingHashConfig {
    fn from_xds(xds: &xds_cluster::cluster::RingHashLbConfig) -> Result<Self, Error> {
        if xds.hash_function() != HashFunction::XxHash {
            return Err(Error::new(format!(
                "unsupported hash function: {:?}",
                xds.hash_function()
            )))
            .with_field("hash_function");
        }

        let min_ring_size = value_or_default!(xds.minimum_ring_size, DEFAULT_MIN_RING_SIZE);
        let max_ring_size = value_or_default!(xds.maximum_ring_size, DEFAULT_MAX_RING_SIZE);

        if min_ring_size > MAX_RING_SIZE {
            return Err(Error::new(format!("must not be larger than {MAX_RING_SIZE}")))
                .with_field("minimum_ring_size");
        }
        if max_ring_size > MAX_RING_SIZE {
            return Err(Error::new(format!("must not be larger than {MAX_RING_SIZE}")))
                .with_field("maximum_ring_size");
        }
        if min_ring_size > max_ring_size {
            return Err(Error::new_static(
                "minimum_ring_size must not be larger than maximum_ring_size",
            ));
        }

        Ok(RingHashConfig {
            min_ring_size,
            max_ring_size,
        })
    }
}

impl UpstreamTls {
    /// Parse an `UpstreamTlsContext` transport socket. Returns `None` for a
    /// transport socket with no config.
    fn from_xds(socket: &xds_core::TransportSocket) -> Result<Option<Self>, Error> {
        use xds_core::transport_socket::ConfigType;

        let any = match &socket.config_type {
            Some(ConfigType::TypedConfig(any)) => any,
            None => return Ok(None),
        };

        if !is_type::<UpstreamTlsContext>(any) {
            return Err(Error::new(format!(
                "unsupported transport socket type: {}",
                any.type_url
            )))
            .with_field("typed_config");
        }

        let tls = any
            .to_msg::<UpstreamTlsContext>()
            .map_err(|e| Error::new(format!("invalid UpstreamTlsContext: {e}")))
            .with_field("typed_config")?;

        let Some(common) = &tls.common_tls_context else {
            return Err(Error::new_static("missing common_tls_context"))
                .with_field("typed_config");
        };

        let validation = match &common.validation_context_type {
            Some(ValidationContextType::ValidationContext(ctx)) => Some(ctx),
            Some(ValidationContextType::CombinedValidationContext(combined)) => {
                combined.default_validation_context.as_ref()
            }
            Some(_) => {
                return Err(Error::new_static("unsupported validation context type"))
                    .with_fields("typed_config", "common_tls_context")
            }
            None => None,
        };

        let (root_provider, subject_alt_name_matchers) = match validation {
            Some(ctx) => validation_context(ctx)
                .with_fields("typed_config", "common_tls_context")?,
            None => (None, vec![]),
        };

        if root_provider.is_none() {
            return Err(Error::new_static(
                "no CA certificate provider instance configured",
            ))
            .with_fields("typed_config", "common_tls_context");
        }

        let identity_provider = common
            .tls_certificate_provider_instance
            .as_ref()
            .map(provider_instance);

        Ok(Some(UpstreamTls {
            root_provider,
            identity_provider,
            subject_alt_name_matchers,
        }))
    }
}

type ValidationContext = (
    Option<CertificateProviderInstance>,
    Vec<crate::matcher::StringMatcher>,
);

fn validation_context(ctx: &CertificateValidationContext) -> Result<ValidationContext, Error> {
    let root = ctx.ca_certificate_provider_instance.as_ref().map(provider_instance);

    #[allow(deprecated)]
    let san_matchers = &ctx.match_subject_alt_names;
    let matchers = san_matchers
        .iter()
        .enumerate()
        .map(|(i, m)| string_matcher_from_xds(m).with_field_index("match_subject_alt_names", i))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((root, matchers))
}

fn provider_instance(p: &CertificateProviderPluginInstance) -> CertificateProviderInstance {
    CertificateProviderInstance {
        instance_name: p.instance_name.clone(),
        certificate_name: p.certificate_name.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use xds_api::pb::{envoy::config::cluster::v3::cluster::EdsClusterConfig, google::protobuf};

    fn ads() -> xds_core::ConfigSource {
        xds_core::ConfigSource {
            config_source_specifier: Some(xds_core::config_source::ConfigSourceSpecifier::Ads(
                xds_core::AggregatedConfigSource {},
            )),
            resource_api_version: xds_core::ApiVersion::V3 as i32,
            ..Default::default()
        }
    }

    fn eds_cluster(name: &str, service_name: &str) -> xds_cluster::Cluster {
        xds_cluster::Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            eds_cluster_config: Some(EdsClusterConfig {
                eds_config: Some(ads()),
                service_name: service_name.to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_eds_cluster() {
        let cluster = Cluster::from_xds(&eds_cluster("cluster-a", "")).unwrap();
        assert_eq!(
            cluster,
            Cluster {
                name: "cluster-a".to_string(),
                kind: ClusterKind::Eds { service_name: None },
                lb_policy: LbPolicy::RoundRobin,
                max_requests: DEFAULT_MAX_REQUESTS,
                lrs_report_to_self: false,
                upstream_tls: None,
            }
        );
        assert_eq!(cluster.eds_service_name(), "cluster-a");

        let cluster = Cluster::from_xds(&eds_cluster("cluster-a", "svc-a")).unwrap();
        assert_eq!(cluster.eds_service_name(), "svc-a");
    }

    #[test]
    fn test_eds_requires_ads() {
        let mut xds = eds_cluster("cluster-a", "");
        if let Some(eds) = &mut xds.eds_cluster_config {
            eds.eds_config = Some(xds_core::ConfigSource::default());
        }

        let err = Cluster::from_xds(&xds).unwrap_err();
        assert_eq!(err.path(), "eds_cluster_config.eds_config");
    }

    #[test]
    fn test_xdstp_requires_service_name() {
        let err = Cluster::from_xds(&eds_cluster(
            "xdstp://authority/envoy.config.cluster.v3.Cluster/a",
            "",
        ))
        .unwrap_err();
        assert_eq!(err.path(), "eds_cluster_config.service_name");
    }

    #[test]
    fn test_aggregate_cluster() {
        let xds = xds_cluster::Cluster {
            name: "agg".to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::ClusterType(
                xds_cluster::cluster::CustomClusterType {
                    name: AGGREGATE_CLUSTER_TYPE.to_string(),
                    typed_config: Some(
                        protobuf::Any::from_msg(&AggregateClusterConfig {
                            clusters: vec!["a".to_string(), "b".to_string()],
                        })
                        .unwrap(),
                    ),
                },
            )),
            ..Default::default()
        };

        let cluster = Cluster::from_xds(&xds).unwrap();
        assert_eq!(
            cluster.kind,
            ClusterKind::Aggregate {
                clusters: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    fn logical_dns(hostname: &str, port: u32, resolver_name: &str) -> xds_cluster::Cluster {
        use xds_endpoint::lb_endpoint::HostIdentifier;

        let address = xds_core::Address {
            address: Some(xds_core::address::Address::SocketAddress(
                xds_core::SocketAddress {
                    address: hostname.to_string(),
                    port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(port)),
                    resolver_name: resolver_name.to_string(),
                    ..Default::default()
                },
            )),
        };

        xds_cluster::Cluster {
            name: "dns".to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(
                DiscoveryType::LogicalDns as i32,
            )),
            load_assignment: Some(xds_endpoint::ClusterLoadAssignment {
                endpoints: vec![xds_endpoint::LocalityLbEndpoints {
                    lb_endpoints: vec![xds_endpoint::LbEndpoint {
                        host_identifier: Some(HostIdentifier::Endpoint(xds_endpoint::Endpoint {
                            address: Some(address),
                            ..Default::default()
                        })),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_logical_dns_cluster() {
        let cluster = Cluster::from_xds(&logical_dns("dns.example.com", 8080, "")).unwrap();
        assert_eq!(
            cluster.kind,
            ClusterKind::LogicalDns {
                hostname: "dns.example.com".to_string(),
                port: 8080,
            }
        );

        let err = Cluster::from_xds(&logical_dns("dns.example.com", 8080, "custom")).unwrap_err();
        assert_eq!(err.path(), "load_assignment.endpoints");
    }

    #[test]
    fn test_ring_hash() {
        use xds_cluster::cluster::{LbConfig, LbPolicy as XdsLbPolicy, RingHashLbConfig};

        let mut xds = eds_cluster("a", "");
        xds.lb_policy = XdsLbPolicy::RingHash as i32;
        xds.lb_config = Some(LbConfig::RingHashLbConfig(RingHashLbConfig {
            minimum_ring_size: Some(protobuf::UInt64Value { value: 10 }),
            maximum_ring_size: Some(protobuf::UInt64Value { value: 100 }),
            hash_function: HashFunction::XxHash as i32,
        }));
        let cluster = Cluster::from_xds(&xds).unwrap();
        assert_eq!(
            cluster.lb_policy,
            LbPolicy::RingHash(RingHashConfig {
                min_ring_size: 10,
                max_ring_size: 100,
            })
        );

        xds.lb_config = Some(LbConfig::RingHashLbConfig(RingHashLbConfig {
            minimum_ring_size: Some(protobuf::UInt64Value { value: 1000 }),
            maximum_ring_size: Some(protobuf::UInt64Value { value: 100 }),
            hash_function: HashFunction::XxHash as i32,
        }));
        assert!(Cluster::from_xds(&xds).is_err());

        xds.lb_config = Some(LbConfig::RingHashLbConfig(RingHashLbConfig {
            hash_function: HashFunction::MurmurHash2 as i32,
            ..Default::default()
        }));
        let err = Cluster::from_xds(&xds).unwrap_err();
        assert_eq!(err.path(), "lb_config.ring_hash_lb_config.hash_function");
    }

    #[test]
    fn test_circuit_breaker_and_lrs() {
        let mut xds = eds_cluster("a", "");
        xds.circuit_breakers = Some(xds_cluster::CircuitBreakers {
            thresholds: vec![
                xds_cluster::circuit_breakers::Thresholds {
                    priority: xds_core::RoutingPriority::High as i32,
                    max_requests: Some(protobuf::UInt32Value { value: 1 }),
                    ..Default::default()
                },
                xds_cluster::circuit_breakers::Thresholds {
                    priority: xds_core::RoutingPriority::Default as i32,
                    max_requests: Some(protobuf::UInt32Value { value: 42 }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        xds.lrs_server = Some(xds_core::ConfigSource {
            config_source_specifier: Some(xds_core::config_source::ConfigSourceSpecifier::Self_(
                xds_core::SelfConfigSource::default(),
            )),
            ..Default::default()
        });

        let cluster = Cluster::from_xds(&xds).unwrap();
        assert_eq!(cluster.max_requests, 42);
        assert!(cluster.lrs_report_to_self);

        xds.lrs_server = Some(ads());
        let err = Cluster::from_xds(&xds).unwrap_err();
        assert_eq!(err.path(), "lrs_server");
    }
}
