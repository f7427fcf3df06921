//! Client bootstrap configuration and runtime knobs.
//!
//! A [Bootstrap] mirrors the layout of an xDS bootstrap file. Finding and
//! reading that file is up to the caller; this module only deserializes it.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use xds_api::pb::{envoy::config::core::v3 as xds_core, google::protobuf};

/// Errors loading a bootstrap config.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid bootstrap json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bootstrap must configure at least one xDS server")]
    NoServers,

    #[error("authority {0} has an invalid resource name template: {1}")]
    InvalidTemplate(String, String),
}

/// A client's bootstrap configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bootstrap {
    /// The servers used for any resource name that doesn't specify an
    /// authority. Only the first server is used.
    pub xds_servers: Vec<XdsServer>,

    #[serde(default)]
    pub node: Node,

    /// Per-authority server overrides for `xdstp://` resource names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub authorities: BTreeMap<String, Authority>,

    /// The template used to build a listener name from a target hostname.
    /// Defaults to `%s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_default_listener_resource_name_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_listener_resource_name_template: Option<String>,

    /// Certificate provider plugin configs, passed through untouched to
    /// whatever loads certificates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub certificate_providers: BTreeMap<String, CertificateProviderPlugin>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct XdsServer {
    pub server_uri: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_features: Vec<String>,
}

/// Keep resources that an xDS server stops sending in a full-state response
/// instead of treating them as deleted.
pub(crate) const IGNORE_RESOURCE_DELETION: &str = "ignore_resource_deletion";

impl XdsServer {
    pub(crate) fn ignore_resource_deletion(&self) -> bool {
        self.server_features
            .iter()
            .any(|f| f == IGNORE_RESOURCE_DELETION)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub cluster: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<meridian_api::endpoint::Locality>,

    /// Opaque metadata, sent to every server as string fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authority {
    /// Servers for this authority. Empty means use the top-level servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xds_servers: Vec<XdsServer>,

    /// Defaults to `xdstp://{authority}/envoy.config.listener.v3.Listener/%s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_listener_resource_name_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateProviderPlugin {
    pub plugin_name: String,

    /// Plugin config as a JSON string.
    #[serde(default)]
    pub config: String,
}

impl Bootstrap {
    pub fn from_json(json: &str) -> Result<Self, BootstrapError> {
        let bootstrap: Bootstrap = serde_json::from_str(json)?;
        bootstrap.validate()?;
        Ok(bootstrap)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, BootstrapError> {
        let bootstrap: Bootstrap = serde_json::from_value(value)?;
        bootstrap.validate()?;
        Ok(bootstrap)
    }

    pub(crate) fn validate(&self) -> Result<(), BootstrapError> {
        if self.xds_servers.is_empty() {
            return Err(BootstrapError::NoServers);
        }

        for (name, authority) in &self.authorities {
            if let Some(template) = &authority.client_listener_resource_name_template {
                let prefix = format!("xdstp://{name}/");
                if !template.starts_with(&prefix) {
                    return Err(BootstrapError::InvalidTemplate(
                        name.clone(),
                        template.clone(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// The default server.
    pub(crate) fn default_server(&self) -> Option<&XdsServer> {
        self.xds_servers.first()
    }

    /// The server for an authority, or `None` if the authority isn't
    /// configured.
    pub(crate) fn server_for_authority(&self, authority: &str) -> Option<&XdsServer> {
        let authority = self.authorities.get(authority)?;
        authority
            .xds_servers
            .first()
            .or_else(|| self.default_server())
    }

    /// A string that uniquely identifies this config, used as the key for
    /// sharing clients.
    pub(crate) fn identity(&self) -> String {
        // serializing a struct made of strings, vecs and btreemaps can't fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub(crate) fn node_proto(&self) -> xds_core::Node {
        let locality = self.node.locality.as_ref().map(|l| xds_core::Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        });

        let metadata = (!self.node.metadata.is_empty()).then(|| protobuf::Struct {
            fields: self
                .node
                .metadata
                .iter()
                .map(|(k, v)| {
                    let value = protobuf::Value {
                        kind: Some(protobuf::value::Kind::StringValue(v.clone())),
                    };
                    (k.clone(), value)
                })
                .collect(),
        });

        xds_core::Node {
            id: self.node.id.clone(),
            cluster: self.node.cluster.clone(),
            locality,
            metadata,
            user_agent_name: env!("CARGO_PKG_NAME").to_string(),
            client_features: vec![
                "envoy.lb.does_not_support_overprovisioning".to_string(),
                "xds.config.resource-in-sotw".to_string(),
                "envoy.lrs.supports_send_all_clusters".to_string(),
            ],
            ..Default::default()
        }
    }
}

/// Runtime knobs for an [XdsClient][crate::XdsClient].
#[derive(Debug, Clone, PartialEq)]
pub struct XdsClientConfig {
    /// How long to wait for a subscribed resource before deciding it does
    /// not exist.
    pub resource_timeout: Duration,

    /// How long calls may keep using a cluster after it's deleted or becomes
    /// invalid before they start failing.
    pub drain_grace_time: Duration,

    /// The upper bound on ring size for ring hash load balancing, applied on
    /// top of each cluster's configured max.
    pub ring_size_cap: u64,

    pub backoff: BackoffConfig,

    /// How long a newly started priority has to connect before the priority
    /// policy fails over to the next one.
    pub priority_failover_timeout: Duration,

    /// How long to keep an unused priority child around in case it comes
    /// back.
    pub child_retention_interval: Duration,
}

impl Default for XdsClientConfig {
    fn default() -> Self {
        Self {
            resource_timeout: Duration::from_secs(15),
            drain_grace_time: Duration::from_secs(10 * 60),
            ring_size_cap: 4096,
            backoff: BackoffConfig::default(),
            priority_failover_timeout: Duration::from_secs(10),
            child_retention_interval: Duration::from_secs(15 * 60),
        }
    }
}

/// Exponential backoff with jitter, per gRPC's connection backoff.
///
/// <https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md>
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max: Duration::from_secs(120),
        }
    }
}
