//! An xDS control plane client.
//!
//! An [XdsClient] subscribes to listeners, route configurations, clusters,
//! and endpoint assignments over ADS, caches them, and hands them out to any
//! number of watchers. On top of the raw resources, the client resolves
//! clusters into a tree of load balancing policies ([ClusterBalancer]),
//! selects routes for requests ([route::select_route]), and runs the fault
//! injection and RBAC HTTP filters ([filter::FilterChain]).
//!
//! Configuration comes from a [Bootstrap] the caller loads, plus an
//! [XdsClientConfig] with client-side knobs.

mod error;
pub use error::{Error, Result};

pub(crate) mod hash;
pub(crate) mod rand;

mod bootstrap;
pub use bootstrap::{
    Authority, BackoffConfig, Bootstrap, BootstrapError, CertificateProviderPlugin, Node,
    XdsClientConfig, XdsServer,
};

mod client;
pub use client::{XdsClient, XdsClientRegistry};

mod xds;
pub use xds::csds::CsdsError;
pub use xds::{
    CacheStatus, Resource, ResourceEvent, ResourceType, ResourceVersion, ResourceWatcher,
    XdsConfig, XdsError,
};

mod lrs;
pub use lrs::ClusterStats;

pub mod lb;

mod resolver;
pub use resolver::{DnsResolver, DnsTarget, NameResolver};

mod balancer;
pub use balancer::{ClusterBalancer, Connector, SubchannelStateSender};

pub mod filter;
pub mod route;
