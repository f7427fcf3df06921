use std::{collections::HashMap, net::IpAddr, str::FromStr};

use ipnet::IpNet;
use xds_api::pb::{
    envoy::{
        config::{
            core::v3 as xds_core,
            rbac::v3::{self as xds_rbac, permission::Rule, principal::Identifier},
            route::v3 as xds_route,
        },
        extensions::filters::{
            common::fault::v3::fault_delay::FaultDelaySecifier,
            http::{
                fault::v3::{fault_abort::ErrorType, HttpFault},
                rbac::v3::{Rbac, RbacPerRoute},
            },
        },
        r#type::matcher::v3::{path_matcher, PathMatcher},
    },
    google::protobuf,
};

use crate::{
    error::{Error, ErrorContext},
    fault::{AbortSource, DelaySource, FaultAbort, FaultConfig, FaultDelay},
    listener::FilterOverride,
    matcher,
    rbac::{Permission, Policy, Principal, RbacAction, RbacConfig, RbacRules},
    route::FilterOverrides,
    xds::{
        duration_from_xds, fractional_percent_from_xds, header_matcher_from_xds, is_type,
        string_matcher_from_xds,
    },
    FractionalPercent,
};

impl FaultConfig {
    pub fn from_xds(xds: &HttpFault) -> Result<Self, Error> {
        let delay = xds
            .delay
            .as_ref()
            .map(|delay| {
                let source = match &delay.fault_delay_secifier {
                    Some(FaultDelaySecifier::FixedDelay(d)) => {
                        DelaySource::Fixed(duration_from_xds(d).with_field("fixed_delay")?)
                    }
                    Some(FaultDelaySecifier::HeaderDelay(_)) => DelaySource::Header,
                    None => return Err(Error::new_static("missing delay type")),
                };
                let percentage = percentage(delay.percentage.as_ref())?;
                Ok(FaultDelay { source, percentage })
            })
            .transpose()
            .with_field("delay")?;

        let abort = xds
            .abort
            .as_ref()
            .map(|abort| {
                let source = match &abort.error_type {
                    Some(ErrorType::HttpStatus(status)) => {
                        if !(200..600).contains(status) {
                            return Err(Error::new_static("must be in range [200, 600)"))
                                .with_field("http_status");
                        }
                        AbortSource::Status(crate::fault::grpc_code_for_http_status(
                            *status as u16,
                        ))
                    }
                    Some(ErrorType::GrpcStatus(code)) => {
                        let code = i32::try_from(*code)
                            .map_err(|_| Error::new_static("invalid grpc status"))
                            .with_field("grpc_status")?;
                        AbortSource::Status(code)
                    }
                    Some(ErrorType::HeaderAbort(_)) => AbortSource::Header,
                    None => return Err(Error::new_static("missing abort type")),
                };
                let percentage = percentage(abort.percentage.as_ref())?;
                Ok(FaultAbort { source, percentage })
            })
            .transpose()
            .with_field("abort")?;

        let max_active_faults = xds.max_active_faults.as_ref().map(|v| v.value);

        Ok(FaultConfig {
            delay,
            abort,
            max_active_faults,
        })
    }
}

fn percentage(
    p: Option<&xds_api::pb::envoy::r#type::v3::FractionalPercent>,
) -> Result<FractionalPercent, Error> {
    match p {
        Some(p) => fractional_percent_from_xds(p).with_field("percentage"),
        None => Ok(FractionalPercent::default()),
    }
}

impl RbacConfig {
    pub fn from_xds(xds: &Rbac) -> Result<Self, Error> {
        let rules = xds
            .rules
            .as_ref()
            .map(RbacRules::from_xds)
            .transpose()
            .with_field("rules")?;

        Ok(RbacConfig { rules })
    }
}

impl RbacRules {
    pub fn from_xds(xds: &xds_rbac::Rbac) -> Result<Self, Error> {
        let action = match xds_rbac::rbac::Action::try_from(xds.action) {
            Ok(xds_rbac::rbac::Action::Allow) => RbacAction::Allow,
            Ok(xds_rbac::rbac::Action::Deny) => RbacAction::Deny,
            Ok(xds_rbac::rbac::Action::Log) => RbacAction::Log,
            Err(_) => return Err(Error::new_static("unknown action")).with_field("action"),
        };

        // policies are a proto map. sort them by name so evaluation order is
        // stable.
        let mut names: Vec<_> = xds.policies.keys().collect();
        names.sort();

        let mut policies = Vec::with_capacity(names.len());
        for name in names {
            let policy = &xds.policies[name];
            let policy = Policy::from_xds(policy)
                .map_err(|e| Error::new(format!("policy {name}: {e}")))
                .with_field("policies")?;
            policies.push((name.clone(), policy));
        }

        Ok(RbacRules { action, policies })
    }
}

impl Policy {
    fn from_xds(xds: &xds_rbac::Policy) -> Result<Self, Error> {
        if xds.condition.is_some() || xds.checked_condition.is_some() {
            return Err(Error::new_static("policy conditions are not supported"));
        }

        let permissions = xds
            .permissions
            .iter()
            .enumerate()
            .map(|(i, p)| Permission::from_xds(p).with_field_index("permissions", i))
            .collect::<Result<Vec<_>, _>>()?;

        let principals = xds
            .principals
            .iter()
            .enumerate()
            .map(|(i, p)| Principal::from_xds(p).with_field_index("principals", i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Policy {
            permissions,
            principals,
        })
    }
}

impl Permission {
    fn from_xds(xds: &xds_rbac::Permission) -> Result<Self, Error> {
        let permission = match &xds.rule {
            Some(Rule::Any(true)) => Permission::Any,
            Some(Rule::Any(false)) => {
                return Err(Error::new_static("any must be true")).with_field("any")
            }
            Some(Rule::AndRules(set)) => {
                Permission::And(permission_set(&set.rules).with_field("and_rules")?)
            }
            Some(Rule::OrRules(set)) => {
                Permission::Or(permission_set(&set.rules).with_field("or_rules")?)
            }
            Some(Rule::NotRule(p)) => {
                Permission::Not(Box::new(Permission::from_xds(p).with_field("not_rule")?))
            }
            Some(Rule::Header(h)) => {
                Permission::Header(header_matcher_from_xds(h).with_field("header")?)
            }
            Some(Rule::UrlPath(p)) => Permission::UrlPath(path_matcher(p).with_field("url_path")?),
            Some(Rule::DestinationIp(cidr)) => {
                Permission::DestinationIp(cidr_from_xds(cidr).with_field("destination_ip")?)
            }
            Some(Rule::DestinationPort(port)) => {
                let port = u16::try_from(*port)
                    .map_err(|_| Error::new_static("invalid port"))
                    .with_field("destination_port")?;
                Permission::DestinationPort(port)
            }
            Some(Rule::RequestedServerName(m)) => Permission::RequestedServerName(
                string_matcher_from_xds(m).with_field("requested_server_name")?,
            ),
            Some(Rule::Metadata(m)) => Permission::Metadata { invert: m.invert },
            Some(_) => return Err(Error::new_static("unsupported permission")),
            None => return Err(Error::new_static("missing permission rule")),
        };

        Ok(permission)
    }
}

fn permission_set(rules: &[xds_rbac::Permission]) -> Result<Vec<Permission>, Error> {
    rules
        .iter()
        .enumerate()
        .map(|(i, p)| Permission::from_xds(p).with_field_index("rules", i))
        .collect()
}

impl Principal {
    fn from_xds(xds: &xds_rbac::Principal) -> Result<Self, Error> {
        let principal = match &xds.identifier {
            Some(Identifier::Any(true)) => Principal::Any,
            Some(Identifier::Any(false)) => {
                return Err(Error::new_static("any must be true")).with_field("any")
            }
            Some(Identifier::AndIds(set)) => {
                Principal::And(principal_set(&set.ids).with_field("and_ids")?)
            }
            Some(Identifier::OrIds(set)) => {
                Principal::Or(principal_set(&set.ids).with_field("or_ids")?)
            }
            Some(Identifier::NotId(p)) => {
                Principal::Not(Box::new(Principal::from_xds(p).with_field("not_id")?))
            }
            Some(Identifier::Authenticated(auth)) => {
                let name = auth
                    .principal_name
                    .as_ref()
                    .map(string_matcher_from_xds)
                    .transpose()
                    .with_fields("authenticated", "principal_name")?;
                Principal::Authenticated(name)
            }
            Some(Identifier::SourceIp(cidr)) => {
                Principal::SourceIp(cidr_from_xds(cidr).with_field("source_ip")?)
            }
            Some(Identifier::DirectRemoteIp(cidr)) => {
                Principal::DirectRemoteIp(cidr_from_xds(cidr).with_field("direct_remote_ip")?)
            }
            Some(Identifier::RemoteIp(cidr)) => {
                Principal::RemoteIp(cidr_from_xds(cidr).with_field("remote_ip")?)
            }
            Some(Identifier::Header(h)) => {
                Principal::Header(header_matcher_from_xds(h).with_field("header")?)
            }
            Some(Identifier::UrlPath(p)) => {
                Principal::UrlPath(path_matcher(p).with_field("url_path")?)
            }
            Some(Identifier::Metadata(m)) => Principal::Metadata { invert: m.invert },
            Some(_) => return Err(Error::new_static("unsupported principal")),
            None => return Err(Error::new_static("missing principal identifier")),
        };

        Ok(principal)
    }
}

fn principal_set(ids: &[xds_rbac::Principal]) -> Result<Vec<Principal>, Error> {
    ids.iter()
        .enumerate()
        .map(|(i, p)| Principal::from_xds(p).with_field_index("ids", i))
        .collect()
}

fn path_matcher(p: &PathMatcher) -> Result<matcher::StringMatcher, Error> {
    match &p.rule {
        Some(path_matcher::Rule::Path(m)) => string_matcher_from_xds(m).with_field("path"),
        None => Err(Error::new_static("missing path matcher")),
    }
}

fn cidr_from_xds(cidr: &xds_core::CidrRange) -> Result<IpNet, Error> {
    let addr = IpAddr::from_str(&cidr.address_prefix)
        .map_err(|e| Error::new(format!("invalid address: {e}")))
        .with_field("address_prefix")?;
    let prefix_len = cidr.prefix_len.as_ref().map(|v| v.value).unwrap_or(0);
    let prefix_len = u8::try_from(prefix_len)
        .map_err(|_| Error::new_static("invalid prefix length"))
        .with_field("prefix_len")?;

    let net = IpNet::new(addr, prefix_len)
        .map_err(|e| Error::new(format!("invalid prefix length: {e}")))
        .with_field("prefix_len")?;

    Ok(net.trunc())
}

/// Parse a `typed_per_filter_config` map into filter overrides.
///
/// Config may be wrapped in a `FilterConfig` that marks it disabled or
/// optional. Unknown config types are an error unless marked optional.
pub(crate) fn filter_overrides_from_xds(
    typed_per_filter_config: &HashMap<String, protobuf::Any>,
) -> Result<FilterOverrides, Error> {
    let mut overrides = FilterOverrides::new();

    for (name, any) in typed_per_filter_config {
        let context = |e: Error| Error::new(format!("filter {name}: {}", e.message()));

        let (config, is_optional) = if is_type::<xds_route::FilterConfig>(any) {
            let wrapper = any
                .to_msg::<xds_route::FilterConfig>()
                .map_err(|e| Error::new(format!("invalid FilterConfig: {e}")))
                .map_err(context)?;

            if wrapper.disabled {
                overrides.insert(name.clone(), FilterOverride::Disabled);
                continue;
            }

            match wrapper.config {
                Some(config) => (config, wrapper.is_optional),
                None => return Err(context(Error::new_static("missing filter config"))),
            }
        } else {
            (any.clone(), false)
        };

        match filter_override_from_any(&config).map_err(context)? {
            Some(o) => {
                overrides.insert(name.clone(), o);
            }
            None if is_optional => continue,
            None => {
                return Err(Error::new(format!(
                    "filter {name}: unsupported filter override type: {}",
                    config.type_url
                )))
            }
        }
    }

    Ok(overrides)
}

fn filter_override_from_any(any: &protobuf::Any) -> Result<Option<FilterOverride>, Error> {
    if is_type::<HttpFault>(any) {
        let fault = any
            .to_msg::<HttpFault>()
            .map_err(|e| Error::new(format!("invalid fault config: {e}")))?;
        return Ok(Some(FilterOverride::Fault(FaultConfig::from_xds(&fault)?)));
    }

    if is_type::<RbacPerRoute>(any) {
        let per_route = any
            .to_msg::<RbacPerRoute>()
            .map_err(|e| Error::new(format!("invalid rbac config: {e}")))?;

        // a per-route override with no rbac config disables the filter
        return match per_route.rbac {
            Some(rbac) => Ok(Some(FilterOverride::Rbac(RbacConfig::from_xds(&rbac)?))),
            None => Ok(Some(FilterOverride::Disabled)),
        };
    }

    Ok(None)
}
