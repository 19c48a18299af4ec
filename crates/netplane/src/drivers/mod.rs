//! Drivers shipped with netplane.

pub mod bridge;
pub mod host;
pub mod null;

use netplane_common::NetResult;

use crate::config::ControllerConfig;
use crate::driverapi::DriverRegistry;

/// Register the built-in drivers, each with its configured options.
pub(crate) fn register_builtin(registry: &DriverRegistry, config: &ControllerConfig) -> NetResult<()> {
    null::NullDriver::register(registry)?;
    host::HostDriver::register(registry)?;
    bridge::BridgeDriver::register(registry, &config.driver_config(bridge::NETWORK_TYPE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_local() {
        let registry = DriverRegistry::new();
        register_builtin(&registry, &ControllerConfig::default()).unwrap();
        assert_eq!(registry.names(), ["bridge", "host", "null"]);
        for name in registry.names() {
            let (driver, cap) = registry.get(&name).unwrap();
            assert!(!cap.is_multihost());
            assert!(driver.is_built_in());
        }
        assert!(register_builtin(&registry, &ControllerConfig::default()).unwrap_err().is_forbidden());
    }
}
