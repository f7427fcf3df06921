//! Route selection.
//!
//! Picks a virtual host by authority, the first matching route in that
//! host, and a cluster from the route's action. The result carries
//! everything the rest of a call needs: the request hash for ring hash
//! balancing, filter overrides, the timeout, and the retry policy.

use std::time::Duration;

use meridian_api::{
    listener::{FilterOverride, HttpConnectionManager},
    matcher::header_value,
    route::{
        ClusterTarget, ForwardAction, HashPolicy, HashPolicyKind, PathMatch, RetryPolicy, Route,
        RouteAction, RouteConfig, RouteMatch, VirtualHost, WeightedCluster,
    },
};

use crate::{hash::thread_local_xxhash, lb::WeightedList, rand::random_below, Error, Result};

/// The parts of an outgoing request that routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    /// The request's `:authority`, used to pick a virtual host.
    pub authority: &'a str,

    /// The request's `:path`, including the query string if any.
    pub path: &'a str,

    pub headers: &'a http::HeaderMap,

    /// A random value fixed for the lifetime of the calling channel, hashed
    /// by `channel_id` hash policies.
    pub channel_id: u64,
}

impl<'a> RouteRequest<'a> {
    fn path_only(&self) -> &'a str {
        match self.path.split_once('?') {
            Some((path, _)) => path,
            None => self.path,
        }
    }

    fn query(&self) -> Option<&'a str> {
        self.path.split_once('?').map(|(_, query)| query)
    }
}

/// The result of routing a request.
#[derive(Debug, Clone)]
pub struct SelectedRoute<'a> {
    pub virtual_host: &'a VirtualHost,
    pub route: &'a Route,
    action: &'a ForwardAction,
    cluster: &'a str,
    weighted_cluster: Option<&'a WeightedCluster>,
    request_hash: Option<u64>,
}

impl<'a> SelectedRoute<'a> {
    /// The cluster to send the request to.
    pub fn cluster(&self) -> &'a str {
        self.cluster
    }

    /// The hash to pass to a ring hash picker, or `None` if no hash policy
    /// produced one.
    pub fn request_hash(&self) -> Option<u64> {
        self.request_hash
    }

    /// The override for an HTTP filter, most specific first: the weighted
    /// cluster, then the route, then the virtual host.
    pub fn filter_override(&self, filter_name: &str) -> Option<&'a FilterOverride> {
        let weighted = self
            .weighted_cluster
            .and_then(|c| c.filter_overrides.get(filter_name));

        weighted
            .or_else(|| self.route.filter_overrides.get(filter_name))
            .or_else(|| self.virtual_host.filter_overrides.get(filter_name))
    }

    /// The maximum duration of a call on this route. The route's timeout
    /// replaces the listener's max stream duration. A zero duration means no
    /// limit.
    pub fn timeout(&self, hcm: &HttpConnectionManager) -> Option<Duration> {
        let timeout = self.action.timeout.or(hcm.max_stream_duration)?;
        match timeout.is_zero() {
            true => None,
            false => Some(*timeout),
        }
    }

    /// The retry policy for this route. Route policies replace virtual host
    /// policies entirely.
    pub fn retry_policy(&self) -> Option<&'a RetryPolicy> {
        self.action
            .retry_policy
            .as_ref()
            .or(self.virtual_host.retry_policy.as_ref())
    }
}

/// Route a request.
///
/// Fails with [Error::NoRouteMatched] if no virtual host or route matches,
/// and [Error::NonForwardingRoute] if the first matching route can't be
/// used by a client.
pub fn select_route<'a>(
    config: &'a RouteConfig,
    request: &RouteRequest<'_>,
) -> Result<SelectedRoute<'a>> {
    let virtual_host =
        find_virtual_host(&config.virtual_hosts, request.authority).ok_or(Error::NoRouteMatched)?;

    let route = virtual_host
        .routes
        .iter()
        .find(|route| is_route_match(&route.matcher, request))
        .ok_or(Error::NoRouteMatched)?;

    let RouteAction::Forward(action) = &route.action else {
        return Err(Error::NonForwardingRoute);
    };

    let (cluster, weighted_cluster) = match &action.target {
        ClusterTarget::Cluster(name) => (name.as_str(), None),
        ClusterTarget::Weighted(clusters) => {
            let cluster = WeightedList::new(clusters.iter().map(|c| (c, c.weight)))
                .random()
                .copied()
                .ok_or(Error::NoRouteMatched)?;
            (cluster.name.as_str(), Some(cluster))
        }
    };

    let request_hash = hash_request(&action.hash_policies, request);

    Ok(SelectedRoute {
        virtual_host,
        route,
        action,
        cluster,
        weighted_cluster,
        request_hash,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DomainMatch {
    Exact,
    Suffix,
    Prefix,
    Universe,
}

fn domain_match(pattern: &str, host: &str) -> Option<DomainMatch> {
    if pattern == "*" {
        return Some(DomainMatch::Universe);
    }

    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix('*') {
        return (!suffix.contains('*') && host.len() > suffix.len() && host.ends_with(suffix))
            .then_some(DomainMatch::Suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return (!prefix.contains('*') && host.len() > prefix.len() && host.starts_with(prefix))
            .then_some(DomainMatch::Prefix);
    }

    (!pattern.contains('*') && pattern == host).then_some(DomainMatch::Exact)
}

/// Find the virtual host for an authority.
///
/// Exact domains beat suffix wildcards, which beat prefix wildcards, which
/// beat `*`. Within a kind of match the longest domain wins, and ties go to
/// the first virtual host.
pub(crate) fn find_virtual_host<'a>(
    virtual_hosts: &'a [VirtualHost],
    authority: &str,
) -> Option<&'a VirtualHost> {
    let mut best: Option<(DomainMatch, usize, &VirtualHost)> = None;

    for vhost in virtual_hosts {
        for domain in &vhost.domains {
            let Some(kind) = domain_match(domain, authority) else {
                continue;
            };

            let better = match best {
                None => true,
                Some((best_kind, best_len, _)) => {
                    kind < best_kind || (kind == best_kind && domain.len() > best_len)
                }
            };
            if better {
                best = Some((kind, domain.len(), vhost));
            }
        }
    }

    best.map(|(_, _, vhost)| vhost)
}

fn is_route_match(matcher: &RouteMatch, request: &RouteRequest) -> bool {
    let path = request.path_only();
    let path_matches = match &matcher.path {
        PathMatch::Regex(regex) => regex.is_full_match(path),
        PathMatch::Prefix(prefix) if matcher.case_sensitive => path.starts_with(prefix.as_str()),
        PathMatch::Exact(exact) if matcher.case_sensitive => path == exact,
        PathMatch::Prefix(prefix) => path
            .to_ascii_lowercase()
            .starts_with(&prefix.to_ascii_lowercase()),
        PathMatch::Exact(exact) => path.eq_ignore_ascii_case(exact),
    };
    if !path_matches {
        return false;
    }

    if !matcher
        .headers
        .iter()
        .all(|m| m.is_match_headers(request.headers))
    {
        return false;
    }

    match &matcher.fraction {
        Some(fraction) => random_below(1_000_000) < fraction.parts_per_million() as u64,
        None => true,
    }
}

/// Hash a request with a list of hash policies.
///
/// The first policy that produces a hash wins. Evaluation stops at the first
/// terminal policy, whether or not it produced a hash.
pub(crate) fn hash_request(policies: &[HashPolicy], request: &RouteRequest) -> Option<u64> {
    for policy in policies {
        if let Some(hash) = hash_component(&policy.kind, request) {
            return Some(hash);
        }

        if policy.terminal {
            break;
        }
    }

    None
}

fn hash_component(kind: &HashPolicyKind, request: &RouteRequest) -> Option<u64> {
    match kind {
        HashPolicyKind::Header { name, rewrite } => {
            if name.ends_with("-bin") {
                return None;
            }

            let value = header_value(request.headers, name)?;
            let hash = match rewrite {
                Some(rewrite) => {
                    let value = rewrite.pattern.replace_all(&value, &rewrite.substitution);
                    thread_local_xxhash::hash_bytes(value.as_bytes())
                }
                None => thread_local_xxhash::hash_bytes(value.as_bytes()),
            };
            Some(hash)
        }
        HashPolicyKind::QueryParameter { name } => {
            let query = request.query()?;
            let values: Vec<_> = form_urlencoded::parse(query.as_bytes())
                .filter_map(|(param, value)| (param == name.as_str()).then_some(value))
                .collect();

            match values.is_empty() {
                true => None,
                false => Some(thread_local_xxhash::hash_bytes(values.join(",").as_bytes())),
            }
        }
        HashPolicyKind::ChannelId => Some(thread_local_xxhash::hash_bytes(
            &request.channel_id.to_le_bytes(),
        )),
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeMap, str::FromStr};

    use meridian_api::{
        fault::FaultConfig,
        matcher::HeaderMatcher,
        route::RegexRewrite,
        FractionalPercent, Regex,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn forward(cluster: &str) -> RouteAction {
        RouteAction::Forward(ForwardAction {
            target: ClusterTarget::Cluster(cluster.to_string()),
            hash_policies: vec![],
            timeout: None,
            retry_policy: None,
        })
    }

    fn route(path: PathMatch, cluster: &str) -> Route {
        Route {
            matcher: RouteMatch {
                path,
                case_sensitive: true,
                headers: vec![],
                fraction: None,
            },
            action: forward(cluster),
            filter_overrides: BTreeMap::new(),
        }
    }

    fn vhost(name: &str, domains: &[&str], routes: Vec<Route>) -> VirtualHost {
        VirtualHost {
            name: name.to_string(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            routes,
            filter_overrides: BTreeMap::new(),
            retry_policy: None,
        }
    }

    fn request<'a>(authority: &'a str, path: &'a str, headers: &'a http::HeaderMap) -> RouteRequest<'a> {
        RouteRequest {
            authority,
            path,
            headers,
            channel_id: 1234,
        }
    }

    #[test]
    fn test_domain_precedence() {
        let vhosts = vec![
            vhost("universe", &["*"], vec![]),
            vhost("prefix", &["foo.*"], vec![]),
            vhost("suffix", &["*.example.com"], vec![]),
            vhost("longer-suffix", &["*.bar.example.com"], vec![]),
            vhost("exact", &["foo.example.com"], vec![]),
        ];

        let find = |authority| find_virtual_host(&vhosts, authority).map(|v| v.name.as_str());
        assert_eq!(find("foo.example.com"), Some("exact"));
        assert_eq!(find("FOO.Example.com"), Some("exact"));
        assert_eq!(find("baz.example.com"), Some("suffix"));
        assert_eq!(find("baz.bar.example.com"), Some("longer-suffix"));
        assert_eq!(find("foo.example.org"), Some("prefix"));
        assert_eq!(find("something.else"), Some("universe"));

        // a wildcard has to match at least one character
        assert_eq!(find(".example.com"), Some("universe"));
    }

    #[test]
    fn test_no_virtual_host() {
        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vhost("only", &["a.example.com"], vec![])],
        };

        let headers = http::HeaderMap::new();
        let err = select_route(&config, &request("b.example.com", "/", &headers)).unwrap_err();
        assert!(matches!(err, Error::NoRouteMatched));
    }

    #[test]
    fn test_first_matching_route_wins() {
        let mut ignore_case = route(PathMatch::Prefix("/Pkg.Service/".to_string()), "case");
        ignore_case.matcher.case_sensitive = false;

        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vhost(
                "vhost",
                &["*"],
                vec![
                    route(PathMatch::Exact("/pkg.Service/Exact".to_string()), "exact"),
                    route(
                        PathMatch::Regex(Regex::from_str("/pkg.Service/Re[a-z]+").unwrap()),
                        "regex",
                    ),
                    ignore_case,
                    route(PathMatch::Prefix("".to_string()), "default"),
                ],
            )],
        };

        let headers = http::HeaderMap::new();
        let cluster = |path| {
            select_route(&config, &request("svc", path, &headers))
                .unwrap()
                .cluster()
        };

        assert_eq!(cluster("/pkg.Service/Exact"), "exact");
        assert_eq!(cluster("/pkg.Service/Exact?x=1"), "exact");
        assert_eq!(cluster("/pkg.Service/Regex"), "regex");
        assert_eq!(cluster("/pkg.Service/Regex2"), "case");
        assert_eq!(cluster("/other.Service/Method"), "default");
    }

    #[test]
    fn test_header_matchers() {
        let mut canary = route(PathMatch::Prefix("/".to_string()), "canary");
        canary.matcher.headers = vec![HeaderMatcher::exact("x-canary", "true")];

        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vhost(
                "vhost",
                &["*"],
                vec![canary, route(PathMatch::Prefix("/".to_string()), "stable")],
            )],
        };

        let mut headers = http::HeaderMap::new();
        assert_eq!(
            select_route(&config, &request("svc", "/a", &headers)).unwrap().cluster(),
            "stable"
        );

        headers.insert("x-canary", "true".parse().unwrap());
        assert_eq!(
            select_route(&config, &request("svc", "/a", &headers)).unwrap().cluster(),
            "canary"
        );
    }

    #[test]
    fn test_zero_fraction_never_matches() {
        let mut never = route(PathMatch::Prefix("/".to_string()), "never");
        never.matcher.fraction = Some(FractionalPercent::per_hundred(0));
        let mut always = route(PathMatch::Prefix("/".to_string()), "always");
        always.matcher.fraction = Some(FractionalPercent::per_hundred(100));

        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vhost("vhost", &["*"], vec![never, always])],
        };

        let headers = http::HeaderMap::new();
        for _ in 0..100 {
            let selected = select_route(&config, &request("svc", "/", &headers)).unwrap();
            assert_eq!(selected.cluster(), "always");
        }
    }

    #[test]
    fn test_non_forwarding_route() {
        let mut non_forwarding = route(PathMatch::Prefix("/".to_string()), "unused");
        non_forwarding.action = RouteAction::NonForwarding;

        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vhost("vhost", &["*"], vec![non_forwarding])],
        };

        let headers = http::HeaderMap::new();
        let err = select_route(&config, &request("svc", "/", &headers)).unwrap_err();
        assert!(matches!(err, Error::NonForwardingRoute));
    }

    #[test]
    fn test_weighted_clusters() {
        let weighted = |name: &str, weight| WeightedCluster {
            name: name.to_string(),
            weight,
            filter_overrides: BTreeMap::new(),
        };

        let mut r = route(PathMatch::Prefix("/".to_string()), "unused");
        r.action = RouteAction::Forward(ForwardAction {
            target: ClusterTarget::Weighted(vec![
                weighted("a", 20),
                weighted("b", 80),
                weighted("c", 0),
            ]),
            hash_policies: vec![],
            timeout: None,
            retry_policy: None,
        });
        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vhost("vhost", &["*"], vec![r])],
        };

        let headers = http::HeaderMap::new();
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for _ in 0..10_000 {
            let selected = select_route(&config, &request("svc", "/", &headers)).unwrap();
            *counts.entry(selected.cluster()).or_default() += 1;
        }

        assert_eq!(counts.get("c"), None);
        let a = counts["a"] as f64 / 10_000.0;
        assert!((0.17..0.23).contains(&a), "a was picked {a}");
    }

    #[test]
    fn test_filter_override_precedence() {
        let fault = |n| FilterOverride::Fault(FaultConfig {
            max_active_faults: Some(n),
            ..Default::default()
        });

        let mut r = route(PathMatch::Prefix("/".to_string()), "unused");
        r.filter_overrides.insert("fault".to_string(), fault(2));
        r.filter_overrides.insert("rbac".to_string(), FilterOverride::Disabled);
        r.action = RouteAction::Forward(ForwardAction {
            target: ClusterTarget::Weighted(vec![WeightedCluster {
                name: "a".to_string(),
                weight: 1,
                filter_overrides: [("fault".to_string(), fault(3))].into(),
            }]),
            hash_policies: vec![],
            timeout: None,
            retry_policy: None,
        });

        let mut vh = vhost("vhost", &["*"], vec![r]);
        vh.filter_overrides.insert("fault".to_string(), fault(1));
        vh.filter_overrides.insert("other".to_string(), fault(1));

        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vh],
        };

        let headers = http::HeaderMap::new();
        let selected = select_route(&config, &request("svc", "/", &headers)).unwrap();
        assert_eq!(selected.filter_override("fault"), Some(&fault(3)));
        assert_eq!(selected.filter_override("rbac"), Some(&FilterOverride::Disabled));
        assert_eq!(selected.filter_override("other"), Some(&fault(1)));
        assert_eq!(selected.filter_override("missing"), None);
    }

    #[test]
    fn test_timeout_and_retries() {
        let mut r = route(PathMatch::Prefix("/".to_string()), "a");
        let mut vh_retries = RetryPolicy::default();
        vh_retries.num_retries = 3;

        let hcm = HttpConnectionManager {
            route_config: meridian_api::listener::RouteSource::Rds {
                name: "routes".to_string(),
            },
            http_filters: vec![],
            max_stream_duration: Some(Duration::from_secs(30).into()),
        };

        let headers = http::HeaderMap::new();
        let mut vh = vhost("vhost", &["*"], vec![r.clone()]);
        vh.retry_policy = Some(vh_retries.clone());
        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vh.clone()],
        };
        let selected = select_route(&config, &request("svc", "/", &headers)).unwrap();
        assert_eq!(selected.timeout(&hcm), Some(Duration::from_secs(30)));
        assert_eq!(selected.retry_policy(), Some(&vh_retries));

        r.action = RouteAction::Forward(ForwardAction {
            target: ClusterTarget::Cluster("a".to_string()),
            hash_policies: vec![],
            timeout: Some(Duration::ZERO.into()),
            retry_policy: Some(RetryPolicy::default()),
        });
        vh.routes = vec![r];
        let config = RouteConfig {
            name: "routes".to_string(),
            virtual_hosts: vec![vh],
        };
        let selected = select_route(&config, &request("svc", "/", &headers)).unwrap();
        assert_eq!(selected.timeout(&hcm), None);
        assert_eq!(selected.retry_policy(), Some(&RetryPolicy::default()));
    }

    #[test]
    fn test_hash_policies() {
        let header = |name: &str, terminal| HashPolicy {
            kind: HashPolicyKind::Header {
                name: name.to_string(),
                rewrite: None,
            },
            terminal,
        };

        let mut headers = http::HeaderMap::new();
        headers.insert("x-user", "alice".parse().unwrap());
        headers.insert("x-session", "1234".parse().unwrap());
        let req = request("svc", "/", &headers);

        let user = thread_local_xxhash::hash_bytes(b"alice");
        let session = thread_local_xxhash::hash_bytes(b"1234");

        assert_eq!(hash_request(&[], &req), None);
        assert_eq!(hash_request(&[header("x-missing", false)], &req), None);
        assert_eq!(hash_request(&[header("x-user", false)], &req), Some(user));
        assert_eq!(
            hash_request(&[header("x-user", false), header("x-session", false)], &req),
            Some(user),
        );
        assert_eq!(
            hash_request(&[header("x-missing", false), header("x-session", false)], &req),
            Some(session),
        );

        // terminal policies stop evaluation whether or not they hash
        assert_eq!(
            hash_request(&[header("x-user", true), header("x-session", false)], &req),
            Some(user),
        );
        assert_eq!(
            hash_request(&[header("x-missing", true), header("x-session", false)], &req),
            None,
        );

        // binary headers are never hashed
        headers.insert("x-key-bin", "AAAA".parse().unwrap());
        let req = request("svc", "/", &headers);
        assert_eq!(hash_request(&[header("x-key-bin", false)], &req), None);
    }

    #[test]
    fn test_hash_rewrite_query_and_channel() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-path", "/users/alice/profile".parse().unwrap());
        let req = request("svc", "/svc/Method?tenant=acme&x=1", &headers);

        let rewrite = HashPolicy {
            kind: HashPolicyKind::Header {
                name: "x-path".to_string(),
                rewrite: Some(RegexRewrite {
                    pattern: Regex::from_str("/users/([a-z]+)/.*").unwrap(),
                    substitution: "$1".to_string(),
                }),
            },
            terminal: false,
        };
        assert_eq!(
            hash_request(&[rewrite], &req),
            Some(thread_local_xxhash::hash_bytes(b"alice"))
        );

        let query = |name: &str| HashPolicy {
            kind: HashPolicyKind::QueryParameter {
                name: name.to_string(),
            },
            terminal: false,
        };
        assert_eq!(
            hash_request(&[query("tenant")], &req),
            Some(thread_local_xxhash::hash_bytes(b"acme"))
        );
        assert_eq!(hash_request(&[query("missing")], &req), None);

        let channel = HashPolicy {
            kind: HashPolicyKind::ChannelId,
            terminal: false,
        };
        let a = hash_request(&[channel.clone()], &req);
        let b = hash_request(&[channel.clone()], &req);
        assert!(a.is_some());
        assert_eq!(a, b);

        let other_channel = RouteRequest {
            channel_id: 5678,
            ..req
        };
        assert_ne!(a, hash_request(&[channel], &other_channel));
    }
}
