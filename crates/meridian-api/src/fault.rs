//! Fault injection configuration.

use serde::{Deserialize, Serialize};

use crate::{Duration, FractionalPercent};

/// Inject delays and aborts into a fraction of requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<FaultDelay>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<FaultAbort>,

    /// The maximum number of requests that may have a fault active at once.
    /// Unlimited if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_faults: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultDelay {
    pub source: DelaySource,
    pub percentage: FractionalPercent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DelaySource {
    Fixed(Duration),

    /// Read the delay from the `x-envoy-fault-delay-request` header.
    Header,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultAbort {
    pub source: AbortSource,
    pub percentage: FractionalPercent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AbortSource {
    /// Abort with a gRPC status code.
    Status(i32),

    /// Read the status from the `x-envoy-fault-abort-grpc-request` or
    /// `x-envoy-fault-abort-request` headers.
    Header,
}

/// Map an HTTP status to the gRPC status code a client reports for it.
///
/// See <https://github.com/grpc/grpc/blob/master/doc/http-grpc-status-mapping.md>.
pub fn grpc_code_for_http_status(status: u16) -> i32 {
    match status {
        400 => 13,                   // INTERNAL
        401 => 16,                   // UNAUTHENTICATED
        403 => 7,                    // PERMISSION_DENIED
        404 => 12,                   // UNIMPLEMENTED
        429 | 502 | 503 | 504 => 14, // UNAVAILABLE
        _ => 2,                      // UNKNOWN
    }
}
