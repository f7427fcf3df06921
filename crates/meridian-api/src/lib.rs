//! Meridian API configuration.
//!
//! Typed, validated versions of the resources an xDS control plane serves to
//! a client: listeners, route configurations, clusters, and endpoint
//! assignments, plus the per-route fault injection and RBAC filter configs.
//!
//! With the `xds` feature enabled, every resource type has a `from_xds`
//! constructor that converts and validates an envoy v3 protobuf. Validation
//! errors carry the path to the offending field.

mod error;
pub use error::Error;

pub mod cluster;
pub mod endpoint;
pub mod fault;
pub mod listener;
pub mod matcher;
pub mod rbac;
pub mod route;

mod shared;
pub use shared::{Denominator, Duration, FractionalPercent, Regex};

#[cfg(feature = "xds")]
mod xds;

#[cfg(feature = "xds")]
macro_rules! value_or_default {
    ($value:expr, $default:expr) => {
        $value.as_ref().map(|v| v.value).unwrap_or($default)
    };
}

#[cfg(feature = "xds")]
pub(crate) use value_or_default;
