//! Common error types for netplane.
//!
//! Every error carries one of the semantic [`ErrorKind`]s so callers can
//! react to the class of failure instead of the concrete variant.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`NetError`].
pub type NetResult<T> = Result<T, NetError>;

/// Semantic classification of a [`NetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller passed a malformed argument.
    InvalidParameter,
    /// Name empty or violating naming rules.
    InvalidName,
    /// ID empty or malformed.
    InvalidId,
    /// Target object is absent.
    NotFound,
    /// Operation would violate an invariant.
    Forbidden,
    /// Semantic mismatch in the request.
    BadRequest,
    /// Upstream or kernel call exceeded its deadline.
    Timeout,
    /// Driver or IPAM not available.
    NoService,
    /// Platform does not support the feature.
    NotImplemented,
    /// Transient, caller may retry.
    Retry,
    /// Catch-all non-maskable failure.
    Internal,
    /// Internal failure that cleanup paths may swallow.
    InternalMaskable,
}

/// Errors raised by the netplane control plane.
#[derive(Error, Diagnostic, Debug)]
pub enum NetError {
    /// Malformed argument.
    #[error("Invalid parameter: {message}")]
    #[diagnostic(code(netplane::invalid_parameter))]
    InvalidParameter {
        /// The error message.
        message: String,
    },

    /// Invalid object name.
    #[error("Invalid name: {name:?}")]
    #[diagnostic(
        code(netplane::invalid_name),
        help("Names must start with an alphanumeric character and contain only [a-zA-Z0-9_.-]")
    )]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// Invalid object ID.
    #[error("Invalid id: {id:?}")]
    #[diagnostic(code(netplane::invalid_id))]
    InvalidId {
        /// The offending ID.
        id: String,
    },

    /// Object not found.
    #[error("{what} not found: {id}")]
    #[diagnostic(code(netplane::not_found))]
    NotFound {
        /// Kind of object that was looked up.
        what: &'static str,
        /// The name or ID that was not found.
        id: String,
    },

    /// Invariant violation.
    #[error("Forbidden: {message}")]
    #[diagnostic(code(netplane::forbidden))]
    Forbidden {
        /// The error message.
        message: String,
    },

    /// Semantic mismatch.
    #[error("Bad request: {message}")]
    #[diagnostic(code(netplane::bad_request))]
    BadRequest {
        /// The error message.
        message: String,
    },

    /// Deadline exceeded.
    #[error("Timed out: {message}")]
    #[diagnostic(code(netplane::timeout))]
    Timeout {
        /// The error message.
        message: String,
    },

    /// Backing service unavailable.
    #[error("Service unavailable: {message}")]
    #[diagnostic(code(netplane::no_service))]
    NoService {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(netplane::not_implemented),
        help("Kernel networking features require Linux")
    )]
    NotImplemented {
        /// The unsupported feature.
        feature: String,
    },

    /// Transient failure.
    #[error("Retry: {message}")]
    #[diagnostic(code(netplane::retry))]
    Retry {
        /// The error message.
        message: String,
    },

    /// A network still has endpoints attached.
    #[error("network {name} id {id} has active endpoints")]
    #[diagnostic(
        code(netplane::network::active_endpoints),
        help("Delete the endpoints first or force the deletion")
    )]
    ActiveEndpoints {
        /// Network name.
        name: String,
        /// Network ID.
        id: String,
    },

    /// An endpoint is still joined to a sandbox.
    #[error("endpoint with name {name} id {id} has active containers")]
    #[diagnostic(code(netplane::endpoint::active_container))]
    ActiveContainer {
        /// Endpoint name.
        name: String,
        /// Endpoint ID.
        id: String,
    },

    /// A network with the same name already exists in the scope.
    #[error("network with name {name} already exists")]
    #[diagnostic(code(netplane::network::name_exists))]
    NetworkNameExists {
        /// The duplicate name.
        name: String,
    },

    /// Datastore key missing.
    #[error("Key not found in store: {key}")]
    #[diagnostic(code(netplane::store::key_not_found))]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// Datastore compare-and-swap mismatch.
    #[error("Key modified since last read: {key}")]
    #[diagnostic(code(netplane::store::key_modified))]
    KeyModified {
        /// The contended key.
        key: String,
    },

    /// Address outside the allocatable range.
    #[error("Requested address {ip} is out of range")]
    #[diagnostic(code(netplane::ipam::out_of_range))]
    IpOutOfRange {
        /// The requested address.
        ip: String,
    },

    /// Address already handed out.
    #[error("Address {ip} already in use")]
    #[diagnostic(code(netplane::ipam::already_allocated))]
    IpAlreadyAllocated {
        /// The requested address.
        ip: String,
    },

    /// Pool exhausted.
    #[error("No available addresses on pool {pool}")]
    #[diagnostic(code(netplane::ipam::no_available_ips))]
    NoAvailableIps {
        /// The exhausted pool.
        pool: String,
    },

    /// No predefined pool left.
    #[error("Could not find an available, non-overlapping IPv{version} address pool")]
    #[diagnostic(code(netplane::ipam::no_available_pool))]
    NoAvailablePool {
        /// IP version (4 or 6).
        version: u8,
    },

    /// Requested pool overlaps an existing one.
    #[error("Pool {pool} overlaps with other one on this address space")]
    #[diagnostic(code(netplane::ipam::pool_overlap))]
    PoolOverlap {
        /// The overlapping pool.
        pool: String,
    },

    /// Malformed pool or pool ID.
    #[error("Invalid pool: {pool}")]
    #[diagnostic(code(netplane::ipam::invalid_pool))]
    InvalidPool {
        /// The offending pool or pool ID.
        pool: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(netplane::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(netplane::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(netplane::internal))]
    Internal {
        /// The error message.
        message: String,
    },

    /// Internal error that cleanup paths may ignore.
    #[error("{message}")]
    #[diagnostic(code(netplane::internal_maskable))]
    InternalMaskable {
        /// The error message.
        message: String,
    },
}

impl NetError {
    /// Shorthand for [`NetError::Forbidden`].
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Shorthand for [`NetError::InvalidParameter`].
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Shorthand for [`NetError::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Shorthand for [`NetError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`NetError::NotFound`].
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    /// The semantic kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::InvalidName { .. } => ErrorKind::InvalidName,
            Self::InvalidId { .. } => ErrorKind::InvalidId,
            Self::NotFound { .. } | Self::KeyNotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. }
            | Self::ActiveEndpoints { .. }
            | Self::ActiveContainer { .. }
            | Self::NetworkNameExists { .. }
            | Self::IpAlreadyAllocated { .. }
            | Self::PoolOverlap { .. } => ErrorKind::Forbidden,
            Self::BadRequest { .. } | Self::IpOutOfRange { .. } | Self::InvalidPool { .. } => {
                ErrorKind::BadRequest
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NoService { .. } | Self::NoAvailableIps { .. } | Self::NoAvailablePool { .. } => {
                ErrorKind::NoService
            }
            Self::NotImplemented { .. } => ErrorKind::NotImplemented,
            Self::Retry { .. } | Self::KeyModified { .. } => ErrorKind::Retry,
            Self::Io(_) | Self::Serialization(_) | Self::Internal { .. } => ErrorKind::Internal,
            Self::InternalMaskable { .. } => ErrorKind::InternalMaskable,
        }
    }

    /// Whether cleanup paths may swallow this error.
    #[must_use]
    pub const fn is_maskable(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalMaskable)
    }

    /// Whether the operation may succeed if retried.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retry)
    }

    /// Whether the target object was absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Whether the operation was refused to protect an invariant.
    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self.kind(), ErrorKind::Forbidden)
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for NetError {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        Self::InvalidParameter {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = NetError::ActiveEndpoints {
            name: "testnetwork".to_string(),
            id: "abc123".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "network testnetwork id abc123 has active endpoints"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NetError = io_err.into();
        assert!(matches!(err, NetError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn store_errors_map_to_kinds() {
        let modified = NetError::KeyModified {
            key: "/netplane/local/network/x".to_string(),
        };
        assert!(modified.is_retry());

        let missing = NetError::KeyNotFound {
            key: "/netplane/local/network/x".to_string(),
        };
        assert!(missing.is_not_found());
    }

    #[test]
    fn ipam_errors_map_to_kinds() {
        let out = NetError::IpOutOfRange {
            ip: "10.0.0.1".to_string(),
        };
        assert_eq!(out.kind(), ErrorKind::BadRequest);

        let full = NetError::NoAvailableIps {
            pool: "LocalDefault/10.0.0.0/30".to_string(),
        };
        assert_eq!(full.kind(), ErrorKind::NoService);
    }

    #[test]
    fn maskable() {
        let err = NetError::InternalMaskable {
            message: "already gone".to_string(),
        };
        assert!(err.is_maskable());
        assert!(!NetError::internal("boom").is_maskable());
    }
}
