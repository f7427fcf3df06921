use xds_api::pb::envoy::config::route::v3::{
    self as xds_route,
    route_action::{hash_policy::PolicySpecifier, ClusterSpecifier},
};

use crate::{
    error::{Error, ErrorContext},
    route::{
        ClusterTarget, ForwardAction, HashPolicy, HashPolicyKind, PathMatch, RegexRewrite,
        RetryPolicy, Route, RouteAction, RouteConfig, RouteMatch, VirtualHost, WeightedCluster,
    },
    value_or_default,
    xds::{
        duration_from_xds, filter::filter_overrides_from_xds, fractional_percent_from_xds,
        header_matcher_from_xds, parse_regex,
    },
    Duration,
};

/// The filter state key that asks for a hash of the client's channel id.
const CHANNEL_ID_KEY: &str = "io.grpc.channel_id";

impl RouteConfig {
    pub fn from_xds(xds: &xds_route::RouteConfiguration) -> Result<Self, Error> {
        let virtual_hosts = xds
            .virtual_hosts
            .iter()
            .enumerate()
            .map(|(i, vhost)| VirtualHost::from_xds(vhost).with_field_index("virtual_hosts", i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RouteConfig {
            name: xds.name.clone(),
            virtual_hosts,
        })
    }
}

impl VirtualHost {
    pub fn from_xds(xds: &xds_route::VirtualHost) -> Result<Self, Error> {
        for (i, domain) in xds.domains.iter().enumerate() {
            validate_domain(domain).with_field_index("domains", i)?;
        }

        let mut routes = Vec::with_capacity(xds.routes.len());
        for (i, route) in xds.routes.iter().enumerate() {
            if let Some(route) = Route::from_xds(route).with_field_index("routes", i)? {
                routes.push(route);
            }
        }

        if routes.is_empty() {
            return Err(Error::new_static("virtual host has no usable routes"))
                .with_field("routes");
        }

        let filter_overrides = filter_overrides_from_xds(&xds.typed_per_filter_config)
            .with_field("typed_per_filter_config")?;

        let retry_policy = xds
            .retry_policy
            .as_ref()
            .map(RetryPolicy::from_xds)
            .transpose()
            .with_field("retry_policy")?;

        Ok(VirtualHost {
            name: xds.name.clone(),
            domains: xds.domains.clone(),
            routes,
            filter_overrides,
            retry_policy,
        })
    }
}

/// Domains may be exact names, `*`, or contain a single wildcard at the
/// beginning or end.
fn validate_domain(domain: &str) -> Result<(), Error> {
    if domain.is_empty() {
        return Err(Error::new_static("domain cannot be empty"));
    }

    if domain == "*" {
        return Ok(());
    }

    let inner = domain
        .strip_prefix('*')
        .or_else(|| domain.strip_suffix('*'))
        .unwrap_or(domain);
    if inner.contains('*') {
        return Err(Error::new(format!("invalid domain pattern: {domain}")));
    }

    Ok(())
}

impl Route {
    /// Convert an xDS route. Returns `Ok(None)` for routes a client should
    /// ignore instead of rejecting, like routes that match on query
    /// parameters or pick a cluster from a request header.
    pub fn from_xds(xds: &xds_route::Route) -> Result<Option<Self>, Error> {
        let Some(r#match) = &xds.r#match else {
            return Err(Error::new_static("missing route match")).with_field("match");
        };

        let Some(matcher) = RouteMatch::from_xds(r#match).with_field("match")? else {
            return Ok(None);
        };

        let action = match &xds.action {
            Some(xds_route::route::Action::Route(action)) => {
                match ForwardAction::from_xds(action).with_field("route")? {
                    Some(action) => RouteAction::Forward(action),
                    None => return Ok(None),
                }
            }
            Some(xds_route::route::Action::NonForwardingAction(_)) => RouteAction::NonForwarding,
            // redirects and direct responses are valid but a client can't
            // do anything with them. requests that match fail.
            Some(_) => RouteAction::NonForwarding,
            None => return Err(Error::new_static("missing route action")),
        };

        let filter_overrides = filter_overrides_from_xds(&xds.typed_per_filter_config)
            .with_field("typed_per_filter_config")?;

        Ok(Some(Route {
            matcher,
            action,
            filter_overrides,
        }))
    }
}

impl RouteMatch {
    pub fn from_xds(xds: &xds_route::RouteMatch) -> Result<Option<Self>, Error> {
        use xds_route::route_match::PathSpecifier;

        // a route that needs query parameters can never match
        if !xds.query_parameters.is_empty() {
            return Ok(None);
        }

        // NOTE: path_specifier is a oneof, so each branch has its own field
        // name in errors.
        let path = match &xds.path_specifier {
            Some(PathSpecifier::Prefix(p)) => PathMatch::Prefix(p.clone()),
            Some(PathSpecifier::Path(p)) => PathMatch::Exact(p.clone()),
            Some(PathSpecifier::SafeRegex(r)) => {
                PathMatch::Regex(parse_regex(r).with_field("safe_regex")?)
            }
            Some(_) => return Ok(None),
            None => return Err(Error::new_static("missing path specifier")),
        };

        let case_sensitive = value_or_default!(xds.case_sensitive, true);

        let headers = xds
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| header_matcher_from_xds(h).with_field_index("headers", i))
            .collect::<Result<Vec<_>, _>>()?;

        let fraction = xds
            .runtime_fraction
            .as_ref()
            .and_then(|f| f.default_value.as_ref())
            .map(fractional_percent_from_xds)
            .transpose()
            .with_fields("runtime_fraction", "default_value")?;

        Ok(Some(RouteMatch {
            path,
            case_sensitive,
            headers,
            fraction,
        }))
    }
}

impl ForwardAction {
    pub fn from_xds(xds: &xds_route::RouteAction) -> Result<Option<Self>, Error> {
        let target = match &xds.cluster_specifier {
            Some(ClusterSpecifier::Cluster(name)) => {
                if name.is_empty() {
                    return Err(Error::new_static("cluster name cannot be empty"))
                        .with_field("cluster");
                }
                ClusterTarget::Cluster(name.clone())
            }
            Some(ClusterSpecifier::WeightedClusters(weighted)) => {
                ClusterTarget::Weighted(weighted_clusters(weighted).with_field("weighted_clusters")?)
            }
            Some(ClusterSpecifier::ClusterHeader(_)) => return Ok(None),
            Some(_) => {
                return Err(Error::new_static("unsupported cluster specifier"));
            }
            None => return Err(Error::new_static("missing cluster specifier")),
        };

        let mut hash_policies = Vec::with_capacity(xds.hash_policy.len());
        for (i, policy) in xds.hash_policy.iter().enumerate() {
            if let Some(policy) = HashPolicy::from_xds(policy).with_field_index("hash_policy", i)? {
                hash_policies.push(policy);
            }
        }

        // grpc_timeout_header_max takes precedence over max_stream_duration
        let timeout = match &xds.max_stream_duration {
            Some(msd) => {
                let timeout = msd
                    .grpc_timeout_header_max
                    .as_ref()
                    .or(msd.max_stream_duration.as_ref());
                timeout
                    .map(duration_from_xds)
                    .transpose()
                    .with_field("max_stream_duration")?
            }
            None => None,
        };

        let retry_policy = xds
            .retry_policy
            .as_ref()
            .map(RetryPolicy::from_xds)
            .transpose()
            .with_field("retry_policy")?;

        Ok(Some(ForwardAction {
            target,
            hash_policies,
            timeout,
            retry_policy,
        }))
    }
}

fn weighted_clusters(xds: &xds_route::WeightedCluster) -> Result<Vec<WeightedCluster>, Error> {
    let mut clusters = Vec::with_capacity(xds.clusters.len());
    let mut total: u64 = 0;

    for (i, cluster) in xds.clusters.iter().enumerate() {
        if cluster.name.is_empty() {
            return Err(Error::new_static("cluster name cannot be empty"))
                .with_field("name")
                .with_field_index("clusters", i);
        }

        let weight = value_or_default!(cluster.weight, 0);
        total += weight as u64;
        let filter_overrides = filter_overrides_from_xds(&cluster.typed_per_filter_config)
            .with_field("typed_per_filter_config")
            .with_field_index("clusters", i)?;

        clusters.push(WeightedCluster {
            name: cluster.name.clone(),
            weight,
            filter_overrides,
        });
    }

    if total == 0 {
        return Err(Error::new_static("sum of cluster weights must be greater than zero"));
    }
    if total > u32::MAX as u64 {
        return Err(Error::new_static("sum of cluster weights exceeds uint32 max"));
    }

    #[allow(deprecated)]
    let total_weight = xds.total_weight.as_ref();
    if let Some(expected) = total_weight {
        if expected.value as u64 != total {
            return Err(Error::new(format!(
                "sum of cluster weights ({total}) does not match total_weight ({})",
                expected.value
            )))
            .with_field("total_weight");
        }
    }

    Ok(clusters)
}

impl HashPolicy {
    /// Convert an xDS hash policy. Hash policies that have no meaning for a
    /// client are skipped.
    pub fn from_xds(xds: &xds_route::route_action::HashPolicy) -> Result<Option<Self>, Error> {
        let kind = match &xds.policy_specifier {
            Some(PolicySpecifier::Header(h)) => {
                let rewrite = h
                    .regex_rewrite
                    .as_ref()
                    .map(|r| {
                        let Some(pattern) = &r.pattern else {
                            return Err(Error::new_static("missing pattern"));
                        };
                        Ok(RegexRewrite {
                            pattern: parse_regex(pattern).with_field("pattern")?,
                            substitution: r.substitution.clone(),
                        })
                    })
                    .transpose()
                    .with_fields("header", "regex_rewrite")?;

                HashPolicyKind::Header {
                    name: h.header_name.clone(),
                    rewrite,
                }
            }
            Some(PolicySpecifier::QueryParameter(q)) => HashPolicyKind::QueryParameter {
                name: q.name.clone(),
            },
            Some(PolicySpecifier::FilterState(f)) if f.key == CHANNEL_ID_KEY => {
                HashPolicyKind::ChannelId
            }
            _ => return Ok(None),
        };

        Ok(Some(HashPolicy {
            kind,
            terminal: xds.terminal,
        }))
    }
}

impl RetryPolicy {
    pub fn from_xds(xds: &xds_route::RetryPolicy) -> Result<Self, Error> {
        let mut retry_on = vec![];
        for condition in xds.retry_on.split(',').map(str::trim) {
            if let Some(code) = retry_code(condition) {
                retry_on.push(code);
            }
        }

        let num_retries = value_or_default!(xds.num_retries, 1);
        if num_retries == 0 {
            return Err(Error::new_static("must be greater than zero")).with_field("num_retries");
        }

        let default = RetryPolicy::default();
        let (base_interval, max_interval) = match &xds.retry_back_off {
            Some(backoff) => {
                let Some(base) = &backoff.base_interval else {
                    return Err(Error::new_static("missing base_interval"))
                        .with_field("retry_back_off");
                };
                let base = duration_from_xds(base).with_fields("retry_back_off", "base_interval")?;
                if base.is_zero() {
                    return Err(Error::new_static("must be greater than zero"))
                        .with_fields("retry_back_off", "base_interval");
                }

                let max = match &backoff.max_interval {
                    Some(max) => {
                        duration_from_xds(max).with_fields("retry_back_off", "max_interval")?
                    }
                    None => Duration::from(*base * 10),
                };
                if *max < *base {
                    return Err(Error::new_static("max_interval must not be less than base"))
                        .with_fields("retry_back_off", "max_interval");
                }

                (base, max)
            }
            None => (default.base_interval, default.max_interval),
        };

        Ok(RetryPolicy {
            retry_on,
            num_retries,
            base_interval,
            max_interval,
        })
    }
}

/// The gRPC status code for a retry_on condition. Conditions that don't
/// name a status are ignored.
fn retry_code(condition: &str) -> Option<i32> {
    match condition {
        "cancelled" => Some(1),
        "deadline-exceeded" => Some(4),
        "resource-exhausted" => Some(8),
        "internal" => Some(13),
        "unavailable" => Some(14),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{listener::FilterOverride, matcher::HeaderMatcher, FractionalPercent};
    use pretty_assertions::assert_eq;
    use xds_api::pb::{
        envoy::r#type::{
            matcher::v3::{RegexMatchAndSubstitute, RegexMatcher},
            v3::{fractional_percent::DenominatorType, FractionalPercent as XdsPercent},
        },
        google::protobuf,
    };

    fn prefix_route(prefix: &str, cluster: &str) -> xds_route::Route {
        xds_route::Route {
            r#match: Some(xds_route::RouteMatch {
                path_specifier: Some(xds_route::route_match::PathSpecifier::Prefix(
                    prefix.to_string(),
                )),
                ..Default::default()
            }),
            action: Some(xds_route::route::Action::Route(xds_route::RouteAction {
                cluster_specifier: Some(ClusterSpecifier::Cluster(cluster.to_string())),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn vhost(domains: &[&str], routes: Vec<xds_route::Route>) -> xds_route::VirtualHost {
        xds_route::VirtualHost {
            name: "vhost".to_string(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            routes,
            ..Default::default()
        }
    }

    #[test]
    fn test_route_config() {
        let mut header_route = prefix_route("/", "cluster-b");
        if let Some(m) = &mut header_route.r#match {
            m.headers = vec![xds_route::HeaderMatcher {
                name: "x-canary".to_string(),
                header_match_specifier: Some(
                    xds_route::header_matcher::HeaderMatchSpecifier::ExactMatch("true".to_string()),
                ),
                ..Default::default()
            }];
            m.case_sensitive = Some(protobuf::BoolValue { value: false });
            m.runtime_fraction = Some(xds_api::pb::envoy::config::core::v3::RuntimeFractionalPercent {
                default_value: Some(XdsPercent {
                    numerator: 50,
                    denominator: DenominatorType::Hundred as i32,
                }),
                ..Default::default()
            });
        }

        let xds = xds_route::RouteConfiguration {
            name: "route.example".to_string(),
            virtual_hosts: vec![vhost(
                &["example.com", "*.example.com"],
                vec![header_route, prefix_route("/", "cluster-a")],
            )],
            ..Default::default()
        };

        let config = RouteConfig::from_xds(&xds).unwrap();
        assert_eq!(config.name, "route.example");
        assert_eq!(
            config.cluster_names().collect::<Vec<_>>(),
            vec!["cluster-b", "cluster-a"]
        );

        let routes = &config.virtual_hosts[0].routes;
        assert_eq!(
            routes[0].matcher,
            RouteMatch {
                path: PathMatch::Prefix("/".to_string()),
                case_sensitive: false,
                headers: vec![HeaderMatcher::exact("x-canary", "true")],
                fraction: Some(FractionalPercent::per_hundred(50)),
            }
        );
    }

    #[test]
    fn test_invalid_domain() {
        let xds = xds_route::RouteConfiguration {
            virtual_hosts: vec![vhost(&["foo.*.com"], vec![prefix_route("/", "a")])],
            ..Default::default()
        };

        let err = RouteConfig::from_xds(&xds).unwrap_err();
        assert_eq!(err.path(), "virtual_hosts[0].domains[0]");
    }

    #[test]
    fn test_ignored_routes() {
        let mut query_route = prefix_route("/", "a");
        if let Some(m) = &mut query_route.r#match {
            m.query_parameters = vec![xds_route::QueryParameterMatcher {
                name: "q".to_string(),
                ..Default::default()
            }];
        }

        let xds = vhost(&["*"], vec![query_route.clone(), prefix_route("/", "b")]);
        let vhost_config = VirtualHost::from_xds(&xds).unwrap();
        assert_eq!(vhost_config.routes.len(), 1);

        // a virtual host where every route is ignored is invalid
        let xds = vhost(&["*"], vec![query_route]);
        let err = VirtualHost::from_xds(&xds).unwrap_err();
        assert_eq!(err.message(), "virtual host has no usable routes");
    }

    fn weighted(clusters: &[(&str, u32)], total: Option<u32>) -> xds_route::Route {
        let mut route = prefix_route("/", "unused");
        #[allow(deprecated)]
        let weighted = xds_route::WeightedCluster {
            clusters: clusters
                .iter()
                .map(|(name, weight)| xds_route::weighted_cluster::ClusterWeight {
                    name: name.to_string(),
                    weight: Some(protobuf::UInt32Value { value: *weight }),
                    ..Default::default()
                })
                .collect(),
            total_weight: total.map(|value| protobuf::UInt32Value { value }),
            ..Default::default()
        };
        if let Some(xds_route::route::Action::Route(action)) = &mut route.action {
            action.cluster_specifier = Some(ClusterSpecifier::WeightedClusters(weighted));
        }
        route
    }

    #[test]
    fn test_weighted_clusters() {
        let route = Route::from_xds(&weighted(&[("a", 3), ("b", 1)], Some(4)))
            .unwrap()
            .unwrap();
        let RouteAction::Forward(action) = route.action else {
            panic!("expected a forwarding action");
        };
        assert_eq!(
            action.target,
            ClusterTarget::Weighted(vec![
                WeightedCluster {
                    name: "a".to_string(),
                    weight: 3,
                    filter_overrides: Default::default(),
                },
                WeightedCluster {
                    name: "b".to_string(),
                    weight: 1,
                    filter_overrides: Default::default(),
                },
            ])
        );

        let err = Route::from_xds(&weighted(&[("a", 0), ("b", 0)], None)).unwrap_err();
        assert_eq!(err.path(), "route.weighted_clusters");

        let err = Route::from_xds(&weighted(&[("a", 3), ("b", 1)], Some(100))).unwrap_err();
        assert_eq!(err.path(), "route.weighted_clusters.total_weight");
    }

    #[test]
    fn test_hash_policies() {
        use xds_route::route_action::hash_policy;

        let policies = vec![
            xds_route::route_action::HashPolicy {
                policy_specifier: Some(PolicySpecifier::Header(hash_policy::Header {
                    header_name: "x-user".to_string(),
                    regex_rewrite: Some(RegexMatchAndSubstitute {
                        pattern: Some(RegexMatcher {
                            regex: "[0-9]+".to_string(),
                            ..Default::default()
                        }),
                        substitution: "N".to_string(),
                    }),
                })),
                terminal: true,
            },
            xds_route::route_action::HashPolicy {
                policy_specifier: Some(PolicySpecifier::ConnectionProperties(
                    hash_policy::ConnectionProperties { source_ip: true },
                )),
                terminal: false,
            },
            xds_route::route_action::HashPolicy {
                policy_specifier: Some(PolicySpecifier::FilterState(hash_policy::FilterState {
                    key: CHANNEL_ID_KEY.to_string(),
                })),
                terminal: false,
            },
        ];

        let mut route = prefix_route("/", "a");
        if let Some(xds_route::route::Action::Route(action)) = &mut route.action {
            action.hash_policy = policies;
        }

        let route = Route::from_xds(&route).unwrap().unwrap();
        let RouteAction::Forward(action) = route.action else {
            panic!("expected a forwarding action");
        };
        assert_eq!(
            action.hash_policies,
            vec![
                HashPolicy {
                    kind: HashPolicyKind::Header {
                        name: "x-user".to_string(),
                        rewrite: Some(RegexRewrite {
                            pattern: "[0-9]+".parse().unwrap(),
                            substitution: "N".to_string(),
                        }),
                    },
                    terminal: true,
                },
                HashPolicy {
                    kind: HashPolicyKind::ChannelId,
                    terminal: false,
                },
            ]
        );
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::from_xds(&xds_route::RetryPolicy {
            retry_on: "cancelled, unavailable,5xx".to_string(),
            num_retries: Some(protobuf::UInt32Value { value: 3 }),
            retry_back_off: Some(xds_route::retry_policy::RetryBackOff {
                base_interval: Some(protobuf::Duration {
                    seconds: 0,
                    nanos: 100_000_000,
                }),
                max_interval: None,
            }),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            policy,
            RetryPolicy {
                retry_on: vec![1, 14],
                num_retries: 3,
                base_interval: Duration::from_millis(100),
                max_interval: Duration::from_secs(1),
            }
        );

        let err = RetryPolicy::from_xds(&xds_route::RetryPolicy {
            num_retries: Some(protobuf::UInt32Value { value: 0 }),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.path(), "num_retries");
    }

    #[test]
    fn test_route_filter_overrides() {
        use xds_api::pb::envoy::extensions::filters::http::rbac::v3::RbacPerRoute;

        let mut route = prefix_route("/", "a");
        route.typed_per_filter_config.insert(
            "rbac".to_string(),
            protobuf::Any::from_msg(&RbacPerRoute { rbac: None }).unwrap(),
        );

        let route = Route::from_xds(&route).unwrap().unwrap();
        assert_eq!(
            route.filter_overrides.get("rbac"),
            Some(&FilterOverride::Disabled)
        );
    }
}
