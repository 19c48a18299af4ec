//! Fallback gateway for containers whose networks give them no way out.
//!
//! When every joined network lacks a gateway (multi-host overlays, for
//! example), the sandbox is also attached to a host bridge network so it
//! can still reach the outside. The attachment comes and goes with the
//! need for it.

use std::collections::BTreeMap;

use netplane_common::{NetError, NetResult, netlabel};

use super::Sandbox;
use crate::endpoint::{Endpoint, EndpointOptions, JoinOptions};
use crate::network::{Network, NetworkOptions};

/// Name of the bridge network providing fallback gateways.
pub const GW_NETWORK: &str = "netplane_gwbridge";

/// Container ID characters used in gateway endpoint names.
const GW_EP_LEN: usize = 12;

impl Sandbox {
    /// Whether no joined endpoint provides a gateway although one is
    /// wanted.
    pub(crate) fn need_default_gw(&self) -> bool {
        let state = self.inner.state.lock();
        let mut need = false;
        for e in &state.endpoints {
            if e.in_gw_network() || e.special() || e.internal {
                continue;
            }
            if e.ep.join_info.disable_gateway_service {
                continue;
            }
            if e.ep.join_info.gw.is_some() {
                return false;
            }
            if e
                .ep
                .join_info
                .static_routes
                .iter()
                .any(|r| r.destination.is_ipv4() && r.destination.prefix() == 0)
            {
                return false;
            }
            need = true;
        }
        need
    }

    /// The endpoint attaching the sandbox to the gateway network.
    pub(crate) fn endpoint_in_gw_network(&self) -> Option<Endpoint> {
        self.inner
            .state
            .lock()
            .endpoints
            .iter()
            .find(|e| e.in_gw_network())
            .map(|e| e.ep.clone())
    }

    /// Attach the sandbox to the gateway network. The caller holds the
    /// sandbox gate.
    pub(crate) fn setup_default_gw(&self) -> NetResult<()> {
        if self.endpoint_in_gw_network().is_some() {
            return Ok(());
        }
        let ctrl = self.controller()?;
        let n = ctrl.default_gw_network()?;

        let cid = self.container_id();
        let short: String = cid.chars().take(GW_EP_LEN).collect();
        let name = format!("gateway_{short}");
        let labels = self.labels();
        let mut options = EndpointOptions::new().with_anonymous();
        for key in [netlabel::PORT_MAP, netlabel::EXPOSED_PORTS] {
            if let Some(value) = labels.get(key) {
                options = options.with_generic(BTreeMap::from([(key.to_string(), value.clone())]));
            }
        }

        let ep = n.create_endpoint(&name, options).map_err(|e| {
            NetError::internal(format!("container {cid}: endpoint create on GW Network failed: {e}"))
        })?;
        if let Err(e) = ep.sb_join(self, &JoinOptions::default()) {
            if let Err(de) = ep.delete(true) {
                tracing::warn!(endpoint = %ep.name(), error = %de, "Failed to remove gateway endpoint after join failure");
            }
            return Err(NetError::internal(format!(
                "container {cid}: endpoint join on GW Network failed: {e}"
            )));
        }
        tracing::debug!(sandbox = %self.id(), endpoint = %name, "Attached to gateway network");
        Ok(())
    }

    /// Detach from the gateway network if attached. The caller holds the
    /// sandbox gate.
    pub(crate) fn clear_default_gw(&self) -> NetResult<()> {
        let Some(ep) = self.endpoint_in_gw_network() else {
            return Ok(());
        };
        let cid = self.container_id();
        ep.sb_leave(self, false).map_err(|e| {
            NetError::internal(format!("container {cid}: endpoint leaving GW Network failed: {e}"))
        })?;
        ep.delete(false).map_err(|e| {
            NetError::internal(format!("container {cid}: deleting endpoint on GW Network failed: {e}"))
        })?;
        tracing::debug!(sandbox = %self.id(), "Detached from gateway network");
        Ok(())
    }
}

/// Options of the gateway network: a masquerading bridge without
/// inter-container traffic.
pub(crate) fn gw_network_options() -> NetworkOptions {
    NetworkOptions::new()
        .with_driver_opts(BTreeMap::from([
            (netlabel::BRIDGE_NAME.to_string(), GW_NETWORK.to_string()),
            (netlabel::BRIDGE_ENABLE_ICC.to_string(), "false".to_string()),
            (netlabel::BRIDGE_ENABLE_IP_MASQUERADE.to_string(), "true".to_string()),
        ]))
        .with_enable_ipv6(false)
}

/// Whether `n` is the gateway network.
pub(crate) fn is_gw_network(n: &Network) -> bool {
    n.name == GW_NETWORK
}
