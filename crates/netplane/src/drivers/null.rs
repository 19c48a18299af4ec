//! The `null` driver: a sandbox with nothing but loopback.

use std::sync::Arc;

use parking_lot::Mutex;

use netplane_common::{GenericOptions, NetError, NetResult};

use crate::driverapi::{Capability, Driver, DriverRegistry, InterfaceInfo, IpamData, JoinInfo};

/// Driver name.
pub const NETWORK_TYPE: &str = "null";

/// The `null` driver. At most one network exists.
#[derive(Debug, Default)]
pub struct NullDriver {
    network: Mutex<Option<String>>,
}

impl NullDriver {
    /// Register the driver under [`NETWORK_TYPE`].
    pub fn register(registry: &DriverRegistry) -> NetResult<()> {
        registry.register(NETWORK_TYPE, Arc::new(Self::default()), Capability::local())
    }
}

impl Driver for NullDriver {
    fn create_network(&self, nid: &str, _: &GenericOptions, _: &[IpamData], _: &[IpamData]) -> NetResult<()> {
        let mut network = self.network.lock();
        if network.is_some() {
            return Err(NetError::forbidden(format!(
                "only one instance of \"{NETWORK_TYPE}\" network is allowed"
            )));
        }
        *network = Some(nid.to_string());
        Ok(())
    }

    fn delete_network(&self, nid: &str) -> NetResult<()> {
        let mut network = self.network.lock();
        if network.as_deref() == Some(nid) {
            *network = None;
        }
        Ok(())
    }

    fn create_endpoint(&self, _: &str, _: &str, _: &mut dyn InterfaceInfo, _: &GenericOptions) -> NetResult<()> {
        Ok(())
    }

    fn delete_endpoint(&self, _: &str, _: &str) -> NetResult<()> {
        Ok(())
    }

    fn endpoint_oper_info(&self, _: &str, _: &str) -> NetResult<GenericOptions> {
        Ok(GenericOptions::new())
    }

    fn join(&self, _: &str, _: &str, _: &str, _: &mut dyn JoinInfo, _: &GenericOptions) -> NetResult<()> {
        Ok(())
    }

    fn leave(&self, _: &str, _: &str) -> NetResult<()> {
        Ok(())
    }

    fn network_type(&self) -> &str {
        NETWORK_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_instance() {
        let driver = NullDriver::default();
        driver.create_network("n1", &GenericOptions::new(), &[], &[]).unwrap();
        let err = driver.create_network("n2", &GenericOptions::new(), &[], &[]).unwrap_err();
        assert!(err.is_forbidden());
        driver.delete_network("n1").unwrap();
        driver.create_network("n2", &GenericOptions::new(), &[], &[]).unwrap();
    }
}
