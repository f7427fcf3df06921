//! Role based access control policy.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::matcher::{HeaderMatcher, StringMatcher};

/// An RBAC filter configuration. A filter with no rules allows every
/// request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RbacConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<RbacRules>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbacRules {
    pub action: RbacAction,

    /// Named policies, evaluated in order.
    #[serde(default)]
    pub policies: Vec<(String, Policy)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RbacAction {
    Allow,
    Deny,
    Log,
}

/// A policy matches a request if any permission and any principal match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub permissions: Vec<Permission>,
    pub principals: Vec<Principal>,
}

/// What a request is trying to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Permission {
    Any,
    And(Vec<Permission>),
    Or(Vec<Permission>),
    Not(Box<Permission>),
    Header(HeaderMatcher),
    UrlPath(StringMatcher),
    DestinationIp(IpNet),
    DestinationPort(u16),
    RequestedServerName(StringMatcher),

    /// Metadata matchers are not evaluated and never match, unless inverted.
    Metadata { invert: bool },
}

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Principal {
    Any,
    And(Vec<Principal>),
    Or(Vec<Principal>),
    Not(Box<Principal>),

    /// Match the authenticated peer identity. A missing matcher matches any
    /// authenticated peer.
    Authenticated(Option<StringMatcher>),
    SourceIp(IpNet),
    DirectRemoteIp(IpNet),
    RemoteIp(IpNet),
    Header(HeaderMatcher),
    UrlPath(StringMatcher),
    Metadata { invert: bool },
}
