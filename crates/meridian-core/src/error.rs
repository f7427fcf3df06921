use crate::xds::ResourceType;

/// A `Result` alias where the `Err` case is `meridian_core::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    #[error("no xDS server configured for authority: {0}")]
    UnknownAuthority(String),

    #[error("xDS client requires a tokio runtime")]
    NoRuntime,

    #[error("xDS client has shut down")]
    Shutdown,

    #[error("{resource_type:?} {name} does not exist")]
    DoesNotExist {
        resource_type: ResourceType,
        name: String,
    },

    #[error("{resource_type:?} {name}: {message}")]
    InvalidResource {
        resource_type: ResourceType,
        name: String,
        message: String,
    },

    #[error("xDS stream error: {0}")]
    Connection(String),

    #[error("aggregate cluster loop detected at {0}")]
    ClusterLoop(String),

    #[error("no route matched this request")]
    NoRouteMatched,

    #[error("matching route has a non-forwarding action")]
    NonForwardingRoute,

    #[error("no reachable endpoints")]
    NoReachableEndpoints,
}

impl Error {
    /// Returns `true` for errors that may resolve on their own as new
    /// configuration arrives or a connection is re-established.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::NoRouteMatched | Error::NoReachableEndpoints
        )
    }

    /// The gRPC status a call fails with when it runs into this error.
    pub fn to_status(&self) -> tonic::Status {
        match self {
            Error::InvalidResourceName(_) | Error::UnknownAuthority(_) => {
                tonic::Status::invalid_argument(self.to_string())
            }
            _ => tonic::Status::unavailable(self.to_string()),
        }
    }
}
