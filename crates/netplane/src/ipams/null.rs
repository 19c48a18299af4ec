//! IPAM for networks whose addresses are managed elsewhere.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::{IpNetwork, Ipv4Network};

use netplane_common::{NetError, NetResult};

use crate::ipamapi::{AllocatedPool, Ipam, IpamOptions, PoolRequest};

/// Address space of the null IPAM.
pub const NULL_SPACE: &str = "null";

const NULL_POOL: &str = "0.0.0.0/0";

/// Hands out the whole IPv4 space as its only pool and no addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIpam;

impl Ipam for NullIpam {
    fn default_address_spaces(&self) -> NetResult<(String, String)> {
        Ok((NULL_SPACE.to_string(), NULL_SPACE.to_string()))
    }

    fn request_pool(&self, request: &PoolRequest) -> NetResult<AllocatedPool> {
        if request.address_space != NULL_SPACE {
            return Err(NetError::invalid_parameter(format!(
                "unknown address space: {}",
                request.address_space
            )));
        }
        let any = IpNetwork::V4(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)?);
        if request.v6 {
            return Err(NetError::invalid_parameter("null ipam does not handle IPv6"));
        }
        if request.pool.is_some_and(|p| p != any) {
            return Err(NetError::invalid_parameter(format!(
                "null ipam only handles {NULL_POOL}"
            )));
        }
        if request.sub_pool.is_some_and(|p| p != any) {
            return Err(NetError::invalid_parameter(format!(
                "null ipam only handles {NULL_POOL} sub-pools"
            )));
        }
        Ok(AllocatedPool {
            id: format!("{NULL_SPACE}/{NULL_POOL}"),
            pool: any,
            meta: IpamOptions::new(),
        })
    }

    fn release_pool(&self, _pool_id: &str) -> NetResult<()> {
        Ok(())
    }

    fn request_address(
        &self,
        _pool_id: &str,
        _ip: Option<IpAddr>,
        _options: &IpamOptions,
    ) -> NetResult<(Option<IpNetwork>, IpamOptions)> {
        Ok((None, IpamOptions::new()))
    }

    fn release_address(&self, _pool_id: &str, _ip: IpAddr) -> NetResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_any_pool() {
        let ipam = NullIpam;
        let req = PoolRequest {
            address_space: NULL_SPACE.to_string(),
            ..PoolRequest::default()
        };
        let pool = ipam.request_pool(&req).unwrap();
        assert_eq!(pool.id, "null/0.0.0.0/0");
        assert_eq!(pool.pool.to_string(), "0.0.0.0/0");

        let v6 = PoolRequest { v6: true, ..req.clone() };
        assert!(ipam.request_pool(&v6).is_err());

        let other = PoolRequest {
            pool: Some("10.0.0.0/8".parse().unwrap()),
            ..req
        };
        assert!(ipam.request_pool(&other).is_err());
    }

    #[test]
    fn hands_out_nothing() {
        let (addr, _) = NullIpam
            .request_address("null/0.0.0.0/0", None, &IpamOptions::new())
            .unwrap();
        assert!(addr.is_none());
        NullIpam
            .release_address("null/0.0.0.0/0", "10.0.0.1".parse().unwrap())
            .unwrap();
    }
}
