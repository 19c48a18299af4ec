//! Namespace and interface tests. Need root on Linux.
#![cfg(all(feature = "integration", target_os = "linux"))]

use std::error::Error;

use netplane_network::{InterfaceOptions, Namespace, VethPair, cmd};
use tempfile::TempDir;

#[test_log::test]
fn create_invoke_destroy() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let key = dir.path().join("netns").join("sb1");

    let ns = Namespace::create(&key)?;
    let links = ns.invoke(|| cmd::output("ip", &["-o", "link", "show"]))?;
    assert!(links.contains("lo:"));
    assert!(links.contains("UP") || links.contains("UNKNOWN"));

    ns.destroy()?;
    assert!(!key.exists());
    Ok(())
}

#[test_log::test]
fn interface_lifecycle() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let ns = Namespace::create(&dir.path().join("sb2"))?;
    let veth = VethPair::create_random(None)?;

    let opts = InterfaceOptions::default()
        .with_mac("02:42:0a:00:00:02".parse()?)
        .with_address("10.99.0.2/24".parse()?);
    let name = ns.add_interface(&veth.container, "eth", opts)?;
    assert_eq!(name, "eth0");

    let addrs = ns.invoke(|| cmd::output("ip", &["-4", "addr", "show", "dev", "eth0"]))?;
    assert!(addrs.contains("10.99.0.2/24"));

    ns.set_gateway("10.99.0.1".parse()?)?;
    let routes = ns.invoke(|| cmd::output("ip", &["-4", "route", "show", "default"]))?;
    assert!(routes.contains("via 10.99.0.1"));

    ns.unset_gateway()?;
    ns.remove_interface("eth0")?;
    assert!(ns.interfaces().is_empty());

    veth.delete()?;
    ns.destroy()?;
    Ok(())
}
