//! End-to-end tests through the bridge driver. Need root on Linux.
#![cfg(all(feature = "integration", target_os = "linux"))]

use std::collections::BTreeMap;
use std::error::Error;
use std::path::Path;

use netplane::{
    Controller, ControllerConfig, EndpointOptions, IpamConfig, JoinOptions, NetworkOptions, SandboxOptions,
};
use netplane_common::{MacAddress, PortBinding, Protocol, netlabel};
use netplane_network::{Namespace, cmd};
use tempfile::TempDir;

fn controller(root: &Path) -> Result<Controller, Box<dyn Error>> {
    Ok(Controller::new(
        ControllerConfig::default()
            .with_root(root)
            .with_memory_store()
            .with_external_key(false),
    )?)
}

fn bridge_options(name: &str, pool: &str, gateway: &str) -> NetworkOptions {
    NetworkOptions::new()
        .with_driver_opts(BTreeMap::from([(netlabel::BRIDGE_NAME.to_string(), name.to_string())]))
        .with_ipam(
            "",
            "",
            vec![IpamConfig::pool(pool).with_gateway(gateway)],
            Vec::new(),
            BTreeMap::new(),
        )
}

fn in_sandbox(key: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let ns = Namespace::restore(Path::new(key))?;
    Ok(ns.invoke(|| cmd::output("ip", args))?)
}

#[test]
fn single_network_join() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let c = controller(dir.path())?;

    let n = c.new_network(
        "bridge",
        "testnetwork",
        None,
        NetworkOptions::new()
            .with_driver_opts(BTreeMap::from([(netlabel::BRIDGE_NAME.to_string(), "testnetwork".to_string())])),
    )?;
    let ep = n.create_endpoint("testep", EndpointOptions::new())?;
    let sb = c.new_sandbox("C", SandboxOptions::new())?;
    ep.join(&sb, JoinOptions::new())?;

    let addr = ep.info()?.address().ok_or("no address")?;
    let gw = n.ipam_info().0[0].data.gateway.ok_or("no gateway")?.ip();
    assert!(n.ipam_info().0[0].data.pool.contains(addr.ip().into()));

    let links = in_sandbox(&sb.key(), &["-4", "addr", "show", "dev", "eth0"])?;
    assert!(links.contains(&addr.to_string()), "{links}");
    let routes = in_sandbox(&sb.key(), &["-4", "route", "show", "default"])?;
    assert!(routes.contains(&format!("via {gw}")), "{routes}");

    let resolv = std::fs::read_to_string(sb.resolv_conf_path())?;
    assert!(resolv.contains("nameserver 127.0.0.11"), "{resolv}");
    assert!(resolv.contains("options ndots:0"), "{resolv}");

    ep.leave(&sb)?;
    ep.delete(false)?;
    sb.delete()?;
    n.delete()?;
    Ok(())
}

#[test]
fn two_networks_one_gateway() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let c = controller(dir.path())?;

    let n1 = c.new_network("bridge", "n1", None, bridge_options("np-n1", "10.151.0.0/24", "10.151.0.1"))?;
    let n2 = c.new_network("bridge", "n2", None, bridge_options("np-n2", "10.152.0.0/24", "10.152.0.1"))?;
    let ep1 = n1.create_endpoint("ep1", EndpointOptions::new())?;
    let ep2 = n2.create_endpoint("ep2", EndpointOptions::new())?;

    let sb = c.new_sandbox("C2", SandboxOptions::new())?;
    ep1.join(&sb, JoinOptions::new())?;
    ep2.join(&sb, JoinOptions::new())?;

    let links = in_sandbox(&sb.key(), &["-o", "link", "show"])?;
    assert!(links.contains("eth0") && links.contains("eth1"), "{links}");
    let k1 = ep1.info()?.sandbox().ok_or("ep1 detached")?.key();
    let k2 = ep2.info()?.sandbox().ok_or("ep2 detached")?.key();
    assert_eq!(k1, k2);

    let routes = in_sandbox(&sb.key(), &["-4", "route", "show", "default"])?;
    assert!(routes.contains("via 10.151.0.1"), "{routes}");
    assert!(!routes.contains("via 10.152.0.1"), "{routes}");

    ep1.leave(&sb)?;
    let routes = in_sandbox(&sb.key(), &["-4", "route", "show", "default"])?;
    assert!(routes.contains("via 10.152.0.1"), "{routes}");

    ep2.leave(&sb)?;
    sb.delete()?;
    ep1.delete(false)?;
    ep2.delete(false)?;
    n1.delete()?;
    n2.delete()?;
    Ok(())
}

#[test]
fn mac_derived_ipv6() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let c = controller(dir.path())?;

    let n = c.new_network(
        "bridge",
        "v6net",
        None,
        NetworkOptions::new()
            .with_driver_opts(BTreeMap::from([(netlabel::BRIDGE_NAME.to_string(), "np-v6".to_string())]))
            .with_enable_ipv6(true)
            .with_defer_ipv6_alloc(true)
            .with_ipam(
                "",
                "",
                vec![IpamConfig::pool("10.153.0.0/24").with_gateway("10.153.0.1")],
                vec![IpamConfig::pool("fe90::/64").with_gateway("fe90::22")],
                BTreeMap::new(),
            ),
    )?;
    let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse()?;
    let ep = n.create_endpoint("v6ep", EndpointOptions::new().with_mac_address(mac))?;

    let v6 = ep.address_ipv6().ok_or("no IPv6 address")?;
    assert_eq!(v6.to_string(), "fe90::aabb:ccdd:eeff/64");
    assert_eq!(ep.mac_address(), Some(mac));

    ep.delete(false)?;
    n.delete()?;
    Ok(())
}

#[test]
fn port_mappings_are_published() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let c = controller(dir.path())?;

    let n = c.new_network("bridge", "ports", None, bridge_options("np-ports", "10.154.0.0/24", "10.154.0.1"))?;
    let bindings = vec![
        PortBinding::new(Protocol::Tcp, 230, 23000),
        PortBinding::new(Protocol::Udp, 200, 22000),
        PortBinding::new(Protocol::Tcp, 120, 12000),
        PortBinding::new(Protocol::Tcp, 320, 0).with_host_range(32000, 32999),
        PortBinding::new(Protocol::Udp, 420, 0).with_host_range(42000, 42001),
    ];
    let ep = n.create_endpoint("web", EndpointOptions::new().with_port_mapping(bindings))?;
    let sb = c.new_sandbox("C6", SandboxOptions::new())?;
    ep.join(&sb, JoinOptions::new())?;

    let info = ep.driver_info()?;
    let mapped: Vec<PortBinding> = serde_json::from_value(
        info.get(netlabel::PORT_MAP).cloned().ok_or("no port map")?,
    )?;
    assert!(mapped.len() == 5 || mapped.len() == 10, "{mapped:?}");

    let nat = cmd::output("iptables", &["-t", "nat", "-S", "NETPLANE"])?;
    for binding in &mapped {
        assert!(nat.contains(&format!("--dport {}", binding.host_port)), "{nat}");
    }
    let ranged = mapped.iter().find(|b| b.port == 320).ok_or("range binding missing")?;
    assert!((32000..=32999).contains(&ranged.host_port));

    ep.leave(&sb)?;
    let nat = cmd::output("iptables", &["-t", "nat", "-S", "NETPLANE"])?;
    assert!(!nat.contains("--dport 23000"), "{nat}");

    sb.delete()?;
    ep.delete(false)?;
    n.delete()?;
    Ok(())
}

#[test]
fn set_key_populates_adopted_namespace() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let c = controller(dir.path())?;

    let n = c.new_network("bridge", "keyed", None, bridge_options("np-keyed", "10.155.0.0/24", "10.155.0.1"))?;
    let ep = n.create_endpoint("ep", EndpointOptions::new())?;
    let sb = c.new_sandbox("C", SandboxOptions::new().use_external_key())?;
    ep.join(&sb, JoinOptions::new())?;

    let source = dir.path().join("container-netns");
    let container_ns = Namespace::create(&source)?;
    sb.set_key(&source.display().to_string())?;

    let addr = ep.info()?.address().ok_or("no address")?;
    let links = in_sandbox(&sb.key(), &["-4", "addr", "show", "dev", "eth0"])?;
    assert!(links.contains(&addr.to_string()), "{links}");
    let routes = in_sandbox(&sb.key(), &["-4", "route", "show", "default"])?;
    assert!(routes.contains("via 10.155.0.1"), "{routes}");

    ep.leave(&sb)?;
    ep.delete(false)?;
    sb.delete()?;
    n.delete()?;
    container_ns.destroy()?;
    Ok(())
}
