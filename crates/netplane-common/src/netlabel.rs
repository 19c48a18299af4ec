//! Well-known option labels exchanged between the controller and drivers.

/// Prefix shared by all labels.
pub const PREFIX: &str = "io.netplane";

/// Driver-specific options passed on network creation.
pub const GENERIC_DATA: &str = "io.netplane.generic";

/// Desired MAC address of an endpoint.
pub const MAC_ADDRESS: &str = "io.netplane.endpoint.macaddress";

/// Ports a container exposes.
pub const EXPOSED_PORTS: &str = "io.netplane.endpoint.exposedports";

/// Host port mappings requested for a container.
pub const PORT_MAP: &str = "io.netplane.endpoint.portmap";

/// Whether a network carries IPv6.
pub const ENABLE_IPV6: &str = "io.netplane.enable_ipv6";

/// MTU for interfaces created by a driver.
pub const DRIVER_MTU: &str = "io.netplane.driver.mtu";

/// IPAM metadata key carrying a gateway hint.
pub const GATEWAY: &str = "io.netplane.gateway";

/// Endpoint join priority.
pub const JOIN_PRIORITY: &str = "io.netplane.join_priority";

/// Network internal flag.
pub const INTERNAL: &str = "io.netplane.internal";

/// Prefix for per-driver configuration passed at controller start.
pub const DRIVER_PREFIX: &str = "io.netplane.driver";

/// Label under which a driver's configuration is stored.
#[must_use]
pub fn driver_config(driver: &str) -> String {
    format!("{DRIVER_PREFIX}.{driver}")
}

/// Bridge driver: name of the Linux bridge.
pub const BRIDGE_NAME: &str = "io.netplane.bridge.name";

/// Bridge driver: enable IP masquerading for outbound traffic.
pub const BRIDGE_ENABLE_IP_MASQUERADE: &str = "io.netplane.bridge.enable_ip_masquerade";

/// Bridge driver: enable inter-container connectivity.
pub const BRIDGE_ENABLE_ICC: &str = "io.netplane.bridge.enable_icc";

/// Bridge driver: default host IP used for port bindings.
pub const BRIDGE_DEFAULT_BIND_IP: &str = "io.netplane.bridge.host_binding_ipv4";

/// Whether `label` belongs to the reserved namespace.
#[must_use]
pub fn is_reserved(label: &str) -> bool {
    label.starts_with(PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_labels() {
        assert_eq!(driver_config("bridge"), "io.netplane.driver.bridge");
        assert!(is_reserved(BRIDGE_NAME));
        assert!(!is_reserved("com.example.label"));
    }
}
