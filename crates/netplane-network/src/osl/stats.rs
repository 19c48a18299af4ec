//! Interface counters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Location of the per-namespace device table, as seen by the reading thread.
pub const NET_DEV: &str = "/proc/thread-self/net/dev";

/// Traffic counters of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStatistics {
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets received.
    pub rx_packets: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Received packets dropped.
    pub rx_dropped: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Packets sent.
    pub tx_packets: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Sent packets dropped.
    pub tx_dropped: u64,
}

/// Parse the `net/dev` table into per-interface counters.
#[must_use]
pub fn parse_net_dev(content: &str) -> BTreeMap<String, InterfaceStatistics> {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let fields: Vec<u64> = counters
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .ok()?;
            if fields.len() < 12 {
                return None;
            }
            Some((
                name.trim().to_string(),
                InterfaceStatistics {
                    rx_bytes: fields[0],
                    rx_packets: fields[1],
                    rx_errors: fields[2],
                    rx_dropped: fields[3],
                    tx_bytes: fields[8],
                    tx_packets: fields[9],
                    tx_errors: fields[10],
                    tx_dropped: fields[11],
                },
            ))
        })
        .collect()
}
