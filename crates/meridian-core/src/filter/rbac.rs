//! Role based access control.

use meridian_api::{
    matcher::HeaderMatcher,
    rbac::{Permission, Policy, Principal, RbacAction, RbacConfig},
};

use super::CallAttributes;

/// The outcome of checking a call against an RBAC config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RbacDecision {
    Allow,

    /// The call is denied. `policy` names the policy that matched a `Deny`
    /// rule, and is `None` if no policy matched an `Allow` rule.
    Deny { policy: Option<String> },
}

impl RbacDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RbacDecision::Allow)
    }

    /// Convert the decision into the status a denied call fails with.
    pub fn into_result(self) -> Result<(), tonic::Status> {
        match self {
            RbacDecision::Allow => Ok(()),
            RbacDecision::Deny { .. } => Err(tonic::Status::permission_denied(
                "Unauthorized RPC rejected",
            )),
        }
    }
}

/// Check a call against an RBAC config.
///
/// A config without rules allows everything. Otherwise, the rules' action
/// applies if any policy matches. An `Allow` rule with no policies denies
/// everything and a `Deny` rule with no policies allows everything. `Log`
/// rules never deny a call.
pub fn evaluate(config: &RbacConfig, call: &CallAttributes) -> RbacDecision {
    let Some(rules) = &config.rules else {
        return RbacDecision::Allow;
    };

    let matched = rules
        .policies
        .iter()
        .find(|(_, policy)| policy_matches(policy, call))
        .map(|(name, _)| name);

    match (rules.action, matched) {
        (RbacAction::Allow, Some(_)) => RbacDecision::Allow,
        (RbacAction::Allow, None) => RbacDecision::Deny { policy: None },
        (RbacAction::Deny, Some(name)) => RbacDecision::Deny {
            policy: Some(name.clone()),
        },
        (RbacAction::Deny, None) => RbacDecision::Allow,
        (RbacAction::Log, matched) => {
            if let Some(name) = matched {
                tracing::info!(policy = %name, path = call.path, "rbac policy matched");
            }
            RbacDecision::Allow
        }
    }
}

fn policy_matches(policy: &Policy, call: &CallAttributes) -> bool {
    policy.permissions.iter().any(|p| permission_matches(p, call))
        && policy.principals.iter().any(|p| principal_matches(p, call))
}

fn permission_matches(permission: &Permission, call: &CallAttributes) -> bool {
    match permission {
        Permission::Any => true,
        Permission::And(rules) => rules.iter().all(|p| permission_matches(p, call)),
        Permission::Or(rules) => rules.iter().any(|p| permission_matches(p, call)),
        Permission::Not(rule) => !permission_matches(rule, call),
        Permission::Header(matcher) => header_matches(matcher, call),
        Permission::UrlPath(matcher) => matcher.is_match(call.path_only()),
        Permission::DestinationIp(net) => call.local_addr.is_some_and(|a| net.contains(&a.ip())),
        Permission::DestinationPort(port) => call.local_addr.is_some_and(|a| a.port() == *port),
        Permission::RequestedServerName(matcher) => {
            matcher.is_match(call.requested_server_name.unwrap_or_default())
        }
        Permission::Metadata { invert } => *invert,
    }
}

fn principal_matches(principal: &Principal, call: &CallAttributes) -> bool {
    match principal {
        Principal::Any => true,
        Principal::And(ids) => ids.iter().all(|p| principal_matches(p, call)),
        Principal::Or(ids) => ids.iter().any(|p| principal_matches(p, call)),
        Principal::Not(id) => !principal_matches(id, call),
        Principal::Authenticated(matcher) => match (call.peer_identities, matcher) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(identities), Some(matcher)) => identities.iter().any(|id| matcher.is_match(id)),
        },
        Principal::SourceIp(net) | Principal::DirectRemoteIp(net) | Principal::RemoteIp(net) => {
            call.peer_addr.is_some_and(|a| net.contains(&a.ip()))
        }
        Principal::Header(matcher) => header_matches(matcher, call),
        Principal::UrlPath(matcher) => matcher.is_match(call.path_only()),
        Principal::Metadata { invert } => *invert,
    }
}

// pseudo-headers aren't in the header map, so they come from the call.
fn header_matches(matcher: &HeaderMatcher, call: &CallAttributes) -> bool {
    match matcher.name.as_str() {
        ":method" => matcher.is_match(Some(call.method)),
        ":path" => matcher.is_match(Some(call.path)),
        ":authority" | "host" => matcher.is_match(Some(call.authority)),
        _ => matcher.is_match_headers(call.headers),
    }
}
