use std::net::{IpAddr, SocketAddr};

use xds_api::pb::{
    envoy::config::{core::v3 as xds_core, endpoint::v3 as xds_endpoint},
    google::protobuf,
};

use crate::{
    endpoint::{
        DropOverload, Endpoint, EndpointSet, HealthStatus, Locality, LocalityEndpoints,
    },
    error::{Error, ErrorContext},
    xds::fractional_percent_from_xds,
};

/// The filter metadata namespace that carries an endpoint's hash key.
const LB_METADATA_NAMESPACE: &str = "envoy.lb";

impl EndpointSet {
    pub fn from_xds(xds: &xds_endpoint::ClusterLoadAssignment) -> Result<Self, Error> {
        let mut localities = Vec::with_capacity(xds.endpoints.len());

        for (i, locality_endpoints) in xds.endpoints.iter().enumerate() {
            // localities without a weight get no traffic, so don't bother
            // with them.
            let weight = locality_endpoints
                .load_balancing_weight
                .as_ref()
                .map(|w| w.value)
                .unwrap_or(0);
            if weight == 0 {
                continue;
            }

            let locality = locality_endpoints
                .locality
                .as_ref()
                .map(|l| Locality {
                    region: l.region.clone(),
                    zone: l.zone.clone(),
                    sub_zone: l.sub_zone.clone(),
                })
                .unwrap_or_default();

            let endpoints = locality_endpoints
                .lb_endpoints
                .iter()
                .enumerate()
                .map(|(j, e)| Endpoint::from_xds(e).with_field_index("lb_endpoints", j))
                .collect::<Result<Vec<_>, _>>()
                .with_field_index("endpoints", i)?;

            localities.push((
                locality_endpoints.priority,
                LocalityEndpoints {
                    locality,
                    weight,
                    endpoints,
                },
            ));
        }

        let drop_overloads = match &xds.policy {
            Some(policy) => policy
                .drop_overloads
                .iter()
                .enumerate()
                .map(|(i, d)| drop_overload(d).with_field_index("drop_overloads", i))
                .collect::<Result<Vec<_>, _>>()
                .with_field("policy")?,
            None => vec![],
        };

        EndpointSet::from_localities(xds.cluster_name.clone(), localities, drop_overloads)
    }
}

fn drop_overload(
    d: &xds_endpoint::cluster_load_assignment::policy::DropOverload,
) -> Result<DropOverload, Error> {
    let parts_per_million = match &d.drop_percentage {
        Some(p) => fractional_percent_from_xds(p)
            .with_field("drop_percentage")?
            .parts_per_million(),
        None => 0,
    };

    Ok(DropOverload {
        category: d.category.clone(),
        parts_per_million,
    })
}

impl Endpoint {
    pub fn from_xds(xds: &xds_endpoint::LbEndpoint) -> Result<Self, Error> {
        use xds_endpoint::lb_endpoint::HostIdentifier;

        let endpoint = match &xds.host_identifier {
            Some(HostIdentifier::Endpoint(e)) => e,
            _ => return Err(Error::new_static("missing endpoint")).with_field("endpoint"),
        };

        let address = endpoint
            .address
            .as_ref()
            .ok_or_else(|| Error::new_static("missing address"))
            .and_then(socket_addr)
            .with_fields("endpoint", "address")?;

        let weight = xds
            .load_balancing_weight
            .as_ref()
            .map(|w| w.value)
            .unwrap_or(1);
        if weight == 0 {
            return Err(Error::new_static("must be greater than zero"))
                .with_field("load_balancing_weight");
        }

        let health = match xds_core::HealthStatus::try_from(xds.health_status) {
            Ok(xds_core::HealthStatus::Unknown) => HealthStatus::Unknown,
            Ok(xds_core::HealthStatus::Healthy) => HealthStatus::Healthy,
            Ok(xds_core::HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            Ok(xds_core::HealthStatus::Draining) => HealthStatus::Draining,
            Ok(xds_core::HealthStatus::Timeout) => HealthStatus::Timeout,
            Ok(xds_core::HealthStatus::Degraded) => HealthStatus::Degraded,
            Err(_) => {
                return Err(Error::new(format!(
                    "unknown health status: {}",
                    xds.health_status
                )))
                .with_field("health_status")
            }
        };

        Ok(Endpoint {
            address,
            health,
            weight,
            hash_key: hash_key(xds.metadata.as_ref()),
        })
    }
}

fn socket_addr(address: &xds_core::Address) -> Result<SocketAddr, Error> {
    use xds_core::{address, socket_address::PortSpecifier};

    let Some(address::Address::SocketAddress(sa)) = &address.address else {
        return Err(Error::new_static("address must be a socket address"));
    };

    let ip: IpAddr = sa
        .address
        .parse()
        .map_err(|e| Error::new(format!("invalid ip address: {e}")))
        .with_field("address")?;

    let port = match sa.port_specifier {
        Some(PortSpecifier::PortValue(port)) => u16::try_from(port)
            .map_err(|_| Error::new_static("port out of range"))
            .with_field("port_value")?,
        _ => return Err(Error::new_static("missing port")).with_field("port_value"),
    };

    Ok(SocketAddr::new(ip, port))
}

fn hash_key(metadata: Option<&xds_core::Metadata>) -> Option<String> {
    let value = metadata?
        .filter_metadata
        .get(LB_METADATA_NAMESPACE)?
        .fields
        .get("hash_key")?;

    match &value.kind {
        Some(protobuf::value::Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lb_endpoint(addr: &str, port: u32, weight: Option<u32>) -> xds_endpoint::LbEndpoint {
        use xds_endpoint::lb_endpoint::HostIdentifier;

        xds_endpoint::LbEndpoint {
            host_identifier: Some(HostIdentifier::Endpoint(xds_endpoint::Endpoint {
                address: Some(xds_core::Address {
                    address: Some(xds_core::address::Address::SocketAddress(
                        xds_core::SocketAddress {
                            address: addr.to_string(),
                            port_specifier: Some(
                                xds_core::socket_address::PortSpecifier::PortValue(port),
                            ),
                            ..Default::default()
                        },
                    )),
                }),
                ..Default::default()
            })),
            load_balancing_weight: weight.map(|value| protobuf::UInt32Value { value }),
            ..Default::default()
        }
    }

    fn locality_endpoints(
        region: &str,
        priority: u32,
        weight: u32,
        endpoints: Vec<xds_endpoint::LbEndpoint>,
    ) -> xds_endpoint::LocalityLbEndpoints {
        xds_endpoint::LocalityLbEndpoints {
            locality: Some(xds_core::Locality {
                region: region.to_string(),
                ..Default::default()
            }),
            lb_endpoints: endpoints,
            load_balancing_weight: Some(protobuf::UInt32Value { value: weight }),
            priority,
            ..Default::default()
        }
    }

    fn cla(endpoints: Vec<xds_endpoint::LocalityLbEndpoints>) -> xds_endpoint::ClusterLoadAssignment {
        xds_endpoint::ClusterLoadAssignment {
            cluster_name: "cluster-a".to_string(),
            endpoints,
            ..Default::default()
        }
    }

    #[test]
    fn test_priorities() {
        let set = EndpointSet::from_xds(&cla(vec![
            locality_endpoints("us-east", 1, 1, vec![lb_endpoint("10.0.0.2", 80, None)]),
            locality_endpoints("us-west", 0, 2, vec![lb_endpoint("10.0.0.1", 80, Some(3))]),
        ]))
        .unwrap();

        assert_eq!(set.cluster_name, "cluster-a");
        assert_eq!(set.priorities.len(), 2);
        assert_eq!(
            set.priorities[0].localities[0],
            LocalityEndpoints {
                locality: Locality::new("us-west", "", ""),
                weight: 2,
                endpoints: vec![Endpoint {
                    address: "10.0.0.1:80".parse().unwrap(),
                    health: HealthStatus::Unknown,
                    weight: 3,
                    hash_key: None,
                }],
            }
        );
        assert_eq!(
            set.priorities[1].localities[0].locality,
            Locality::new("us-east", "", "")
        );
    }

    #[test]
    fn test_sparse_priorities() {
        let err = EndpointSet::from_xds(&cla(vec![
            locality_endpoints("us-east", 0, 1, vec![lb_endpoint("10.0.0.2", 80, None)]),
            locality_endpoints("us-west", 2, 1, vec![lb_endpoint("10.0.0.1", 80, None)]),
        ]))
        .unwrap_err();
        assert_eq!(err.message(), "sparse priority list");
    }

    #[test]
    fn test_zero_weight_locality_skipped() {
        let set = EndpointSet::from_xds(&cla(vec![
            locality_endpoints("us-east", 0, 0, vec![lb_endpoint("10.0.0.2", 80, None)]),
            locality_endpoints("us-west", 0, 1, vec![lb_endpoint("10.0.0.1", 80, None)]),
        ]))
        .unwrap();
        assert_eq!(set.priorities[0].localities.len(), 1);
        assert_eq!(
            set.priorities[0].localities[0].locality,
            Locality::new("us-west", "", "")
        );
    }

    #[test]
    fn test_zero_weight_endpoint() {
        let err = EndpointSet::from_xds(&cla(vec![locality_endpoints(
            "us-east",
            0,
            1,
            vec![
                lb_endpoint("10.0.0.1", 80, None),
                lb_endpoint("10.0.0.2", 80, Some(0)),
            ],
        )]))
        .unwrap_err();
        assert_eq!(err.path(), "endpoints[0].lb_endpoints[1].load_balancing_weight");
    }

    #[test]
    fn test_hostname_address() {
        let err = EndpointSet::from_xds(&cla(vec![locality_endpoints(
            "us-east",
            0,
            1,
            vec![lb_endpoint("example.com", 80, None)],
        )]))
        .unwrap_err();
        assert_eq!(
            err.path(),
            "endpoints[0].lb_endpoints[0].endpoint.address.address"
        );
    }

    #[test]
    fn test_drops_and_hash_key() {
        use xds_api::pb::envoy::r#type::v3::{
            fractional_percent::DenominatorType, FractionalPercent,
        };

        let mut endpoint = lb_endpoint("10.0.0.1", 80, None);
        endpoint.metadata = Some(xds_core::Metadata {
            filter_metadata: HashMap::from([(
                LB_METADATA_NAMESPACE.to_string(),
                protobuf::Struct {
                    fields: HashMap::from([(
                        "hash_key".to_string(),
                        protobuf::Value {
                            kind: Some(protobuf::value::Kind::StringValue("host-1".to_string())),
                        },
                    )]),
                },
            )]),
            ..Default::default()
        });

        let mut xds = cla(vec![locality_endpoints("us-east", 0, 1, vec![endpoint])]);
        xds.policy = Some(xds_endpoint::cluster_load_assignment::Policy {
            drop_overloads: vec![
                xds_endpoint::cluster_load_assignment::policy::DropOverload {
                    category: "lb".to_string(),
                    drop_percentage: Some(FractionalPercent {
                        numerator: 5,
                        denominator: DenominatorType::Hundred as i32,
                    }),
                },
            ],
            ..Default::default()
        });

        let set = EndpointSet::from_xds(&xds).unwrap();
        assert_eq!(
            set.drop_overloads,
            vec![DropOverload {
                category: "lb".to_string(),
                parts_per_million: 50_000,
            }]
        );
        assert_eq!(
            set.priorities[0].localities[0].endpoints[0].hash_key.as_deref(),
            Some("host-1")
        );
    }
}
