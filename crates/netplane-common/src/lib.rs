//! # netplane-common
//!
//! Shared types and errors for the netplane networking control plane.
//!
//! This crate provides the vocabulary used across all netplane crates:
//! - Error kinds and the crate-wide error type
//! - Object ID generation and name validation
//! - Standard filesystem paths
//! - IP, MAC and CIDR helpers plus port and route records
//! - Well-known option labels

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod netlabel;
pub mod paths;
pub mod types;

pub use error::{ErrorKind, NetError, NetResult};
pub use id::{generate_id, is_valid_name, short_id};
pub use paths::NetplanePaths;
pub use types::{
    GenericOptions, IpFamily, MacAddress, PortBinding, Protocol, RouteType, StaticRoute,
    TransportPort,
};
