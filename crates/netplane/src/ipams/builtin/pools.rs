//! Predefined address pools handed out when a network names none.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

/// Local scope: `172.17-31.0.0/16`, then `192.168.0.0/16` cut into `/20`s.
pub fn local() -> impl Iterator<Item = Ipv4Network> {
    let class_b =
        (17u8..=31).filter_map(|second| Ipv4Network::new(Ipv4Addr::new(172, second, 0, 0), 16).ok());
    let class_c =
        (0u8..16).filter_map(|i| Ipv4Network::new(Ipv4Addr::new(192, 168, i * 16, 0), 20).ok());
    class_b.chain(class_c)
}

/// Global scope: `10.0.0.0/8` cut into `/24`s.
pub fn global() -> impl Iterator<Item = Ipv4Network> {
    (0u32..1 << 16).filter_map(|i| {
        let base = u32::from(Ipv4Addr::new(10, 0, 0, 0)) | (i << 8);
        Ipv4Network::new(Ipv4Addr::from(base), 24).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pools() {
        let pools: Vec<String> = local().map(|p| p.to_string()).collect();
        assert_eq!(pools.len(), 31);
        assert_eq!(pools[0], "172.17.0.0/16");
        assert_eq!(pools[14], "172.31.0.0/16");
        assert_eq!(pools[15], "192.168.0.0/20");
        assert_eq!(pools[30], "192.168.240.0/20");
    }

    #[test]
    fn global_pools() {
        let mut pools = global();
        assert_eq!(pools.next().unwrap().to_string(), "10.0.0.0/24");
        assert_eq!(pools.next().unwrap().to_string(), "10.0.1.0/24");
        assert_eq!(global().last().unwrap().to_string(), "10.255.255.0/24");
    }
}
