//! # netplane
//!
//! Container networking control plane.
//!
//! A [`Controller`] manages the lifecycle of networks, endpoints and
//! sandboxes. Networks are created through a registered [`driverapi::Driver`]
//! and get their address pools from an [`ipamapi::Ipam`]; endpoints are the
//! attachment points a container joins through its [`Sandbox`].
//!
//! ## Usage
//!
//! ```no_run
//! use netplane::{Controller, ControllerConfig, EndpointOptions, JoinOptions, NetworkOptions, SandboxOptions};
//!
//! # fn example() -> netplane::NetResult<()> {
//! let controller = Controller::new(ControllerConfig::default())?;
//!
//! let network = controller.new_network("bridge", "appnet", None, NetworkOptions::new())?;
//! let endpoint = network.create_endpoint("web", EndpointOptions::new())?;
//!
//! let sandbox = controller.new_sandbox("container-1", SandboxOptions::new().hostname("web"))?;
//! endpoint.join(&sandbox, JoinOptions::new())?;
//!
//! endpoint.leave(&sandbox)?;
//! endpoint.delete(false)?;
//! sandbox.delete()?;
//! network.delete()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod datastore;
pub mod driverapi;
pub mod drivers;
pub mod endpoint;
pub mod endpoint_cnt;
pub mod endpoint_info;
pub mod external_key;
pub mod ipamapi;
pub mod ipams;
pub mod network;
pub mod resolver;
pub mod sandbox;
pub mod service;
mod watch;

pub use config::{ControllerConfig, LocalStoreKind};
pub use controller::Controller;
pub use datastore::{DataScope, FileStore, KvStore, MemoryStore};
pub use endpoint::{Endpoint, EndpointOptions, JoinOptions};
pub use external_key::{set_external_key, set_external_key_at};
pub use netplane_common::{ErrorKind, NetError, NetResult};
pub use network::{IpamConfig, Network, NetworkOptions};
pub use sandbox::{Sandbox, SandboxOptions};
