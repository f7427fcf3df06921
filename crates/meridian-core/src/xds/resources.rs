use std::{ops::Deref, sync::Arc};

use meridian_api::{cluster::Cluster, endpoint::EndpointSet, listener::Listener, route::RouteConfig};
use smol_str::SmolStr;
use xds_api::{
    pb::{
        envoy::{
            config::{
                cluster::v3 as xds_cluster, endpoint::v3 as xds_endpoint,
                listener::v3 as xds_listener, route::v3 as xds_route,
            },
            service::discovery::v3 as xds_discovery,
        },
        google::protobuf,
    },
    WellKnownTypes,
};

/// An opaque string used to version an xDS resource.
///
/// `ResourceVersion`s are immutable and cheap to `clone` and share.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(SmolStr);

impl Deref for ResourceVersion {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl AsRef<str> for ResourceVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

macro_rules! impl_resource_version_from {
    ($from_ty:ty) => {
        impl From<$from_ty> for ResourceVersion {
            fn from(s: $from_ty) -> ResourceVersion {
                ResourceVersion(s.into())
            }
        }
    };
}

impl_resource_version_from!(&str);
impl_resource_version_from!(String);
impl_resource_version_from!(&String);
impl_resource_version_from!(Arc<str>);

/// One of the four discovery resource kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, enum_map::Enum)]
pub enum ResourceType {
    Listener,
    RouteConfiguration,
    Cluster,
    ClusterLoadAssignment,
}

impl ResourceType {
    fn as_well_known(&self) -> WellKnownTypes {
        match self {
            ResourceType::Listener => WellKnownTypes::Listener,
            ResourceType::RouteConfiguration => WellKnownTypes::RouteConfiguration,
            ResourceType::Cluster => WellKnownTypes::Cluster,
            ResourceType::ClusterLoadAssignment => WellKnownTypes::ClusterLoadAssignment,
        }
    }

    fn from_well_known(wkt: WellKnownTypes) -> Option<Self> {
        match wkt {
            WellKnownTypes::Listener => Some(Self::Listener),
            WellKnownTypes::RouteConfiguration => Some(Self::RouteConfiguration),
            WellKnownTypes::Cluster => Some(Self::Cluster),
            WellKnownTypes::ClusterLoadAssignment => Some(Self::ClusterLoadAssignment),
            _ => None,
        }
    }

    /// Every resource type, in make-before-break order.
    pub(crate) fn all() -> &'static [Self] {
        &[
            Self::Cluster,
            Self::ClusterLoadAssignment,
            Self::Listener,
            Self::RouteConfiguration,
        ]
    }

    pub fn type_url(&self) -> &'static str {
        self.as_well_known().type_url()
    }

    /// The fully qualified protobuf message name, as used in `xdstp://` names.
    pub(crate) fn type_name(&self) -> &'static str {
        let url = self.type_url();
        url.rsplit_once('/').map(|(_, name)| name).unwrap_or(url)
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::from_well_known(WellKnownTypes::from_type_url(type_url)?)
    }

    /// Listeners and Clusters are full state: every response carries every
    /// subscribed resource, so a missing resource has been deleted.
    pub(crate) fn is_full_state(&self) -> bool {
        matches!(self, ResourceType::Listener | ResourceType::Cluster)
    }

    /// Decode and validate one resource from a response.
    ///
    /// Returns an error if the resource can't be decoded far enough to
    /// recover its name. Once the name is known, validation errors are
    /// returned as part of the [DecodedResource].
    pub(crate) fn decode(&self, any: protobuf::Any) -> Result<DecodedResource, String> {
        let any = unwrap_resource(any)?;

        macro_rules! decode_as {
            ($xds_ty:ty, $name:expr, $convert:expr, $variant:ident) => {{
                let xds: $xds_ty = any
                    .to_msg()
                    .map_err(|e| format!("failed to decode resource: {e}"))?;
                let name: String = $name(&xds);
                let value = $convert(&xds)
                    .map(|v| ResourceValue::$variant(Arc::new(v)))
                    .map_err(|e: meridian_api::Error| e.to_string());
                Ok(DecodedResource {
                    name,
                    raw: any,
                    value,
                })
            }};
        }

        match self {
            ResourceType::Listener => decode_as!(
                xds_listener::Listener,
                |l: &xds_listener::Listener| l.name.clone(),
                Listener::from_xds,
                Listener
            ),
            ResourceType::RouteConfiguration => decode_as!(
                xds_route::RouteConfiguration,
                |r: &xds_route::RouteConfiguration| r.name.clone(),
                RouteConfig::from_xds,
                RouteConfig
            ),
            ResourceType::Cluster => decode_as!(
                xds_cluster::Cluster,
                |c: &xds_cluster::Cluster| c.name.clone(),
                Cluster::from_xds,
                Cluster
            ),
            ResourceType::ClusterLoadAssignment => decode_as!(
                xds_endpoint::ClusterLoadAssignment,
                |c: &xds_endpoint::ClusterLoadAssignment| c.cluster_name.clone(),
                EndpointSet::from_xds,
                Endpoints
            ),
        }
    }
}

/// Servers may wrap resources in a `Resource` envelope. Unwrap it so the rest
/// of the client only ever deals with the bare resource.
fn unwrap_resource(any: protobuf::Any) -> Result<protobuf::Any, String> {
    if any.type_url != <xds_discovery::Resource as prost::Name>::type_url() {
        return Ok(any);
    }

    let wrapper: xds_discovery::Resource = any
        .to_msg()
        .map_err(|e| format!("failed to decode resource wrapper: {e}"))?;
    wrapper
        .resource
        .ok_or_else(|| "resource wrapper is empty".to_string())
}

/// A resource from a discovery response that has been decoded and validated.
#[derive(Debug, Clone)]
pub(crate) struct DecodedResource {
    pub name: String,
    pub raw: protobuf::Any,
    pub value: Result<ResourceValue, String>,
}

/// A validated resource of any type.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResourceValue {
    Listener(Arc<Listener>),
    RouteConfig(Arc<RouteConfig>),
    Cluster(Arc<Cluster>),
    Endpoints(Arc<EndpointSet>),
}

/// A resource type that can be watched through an
/// [XdsClient][crate::XdsClient].
///
/// This trait is sealed and implemented for the four resource types in
/// [meridian_api].
pub trait Resource: private::Sealed + std::fmt::Debug + Send + Sync + 'static {
    const TYPE: ResourceType;

    #[doc(hidden)]
    fn from_value(value: &ResourceValue) -> Option<Arc<Self>>;
}

mod private {
    pub trait Sealed {}
}

macro_rules! impl_resource {
    ($ty:ty, $resource_type:ident, $variant:ident) => {
        impl private::Sealed for $ty {}

        impl Resource for $ty {
            const TYPE: ResourceType = ResourceType::$resource_type;

            fn from_value(value: &ResourceValue) -> Option<Arc<Self>> {
                match value {
                    ResourceValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_resource!(Listener, Listener, Listener);
impl_resource!(RouteConfig, RouteConfiguration, RouteConfig);
impl_resource!(Cluster, Cluster, Cluster);
impl_resource!(EndpointSet, ClusterLoadAssignment, Endpoints);
