// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod consts;
pub mod link;
pub mod softport;
pub mod stats;
pub mod types;

pub use self::{
    link::{
        Duplex,
        LinkStatus,
    },
    softport::SoftPort,
    stats::{
        PortInfo,
        PortStats,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::Mbuf,
    network::types::MacAddress,
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Port shared between the bonding layer and whoever else drives it.
pub type SharedPort = Arc<dyn PhysicalPort>;

/// Link-status-change callback. Invoked with the identifier of the port whose link changed.
pub type LscCallback = Arc<dyn Fn(u16) + Send + Sync>;

//======================================================================================================================
// Traits
//======================================================================================================================

/// API of a poll-mode network port (e.g., a NIC driven by a userspace driver). Every method takes `&self`: ports are
/// shared by data-plane threads and the control plane, so implementations synchronize internally. Burst calls never
/// block.
pub trait PhysicalPort: Send + Sync {
    /// Returns the identifier of the target port.
    fn port_id(&self) -> u16;

    /// Receives at most `max` packets from `queue`, appending them to `pkts`. Returns the number of packets received.
    fn rx_burst(&self, queue: u16, pkts: &mut Vec<Mbuf>, max: usize) -> usize;

    /// Checks how many leading packets of `pkts` are ready to be transmitted on `queue`.
    fn tx_prepare(&self, _queue: u16, pkts: &[Mbuf]) -> usize {
        pkts.len()
    }

    /// Transmits packets on `queue`. Accepted packets are taken from the front of `pkts`; the packets that were not
    /// accepted stay in `pkts`, in their original order. Returns the number of packets accepted.
    fn tx_burst(&self, queue: u16, pkts: &mut Vec<Mbuf>) -> usize;

    /// Retrieves the link status, waiting for it to settle if needed.
    fn link_get(&self) -> Result<LinkStatus, Fail>;

    /// Retrieves the link status without waiting.
    fn link_get_nowait(&self) -> Result<LinkStatus, Fail>;

    /// Returns `true` if the port raises link-status-change interrupts, and `false` if it has to be polled.
    fn supports_lsc_interrupt(&self) -> bool;

    /// Registers a link-status-change callback. Returns a token for [PhysicalPort::unregister_lsc_callback].
    fn register_lsc_callback(&self, _callback: LscCallback) -> Result<u64, Fail> {
        Err(Fail::new(libc::ENOTSUP, "link-status-change interrupts not supported"))
    }

    fn unregister_lsc_callback(&self, _token: u64) -> Result<(), Fail> {
        Err(Fail::new(libc::ENOTSUP, "link-status-change interrupts not supported"))
    }

    /// Returns the default MAC address of the port.
    fn mac_addr(&self) -> MacAddress;

    fn set_default_mac_addr(&self, mac: MacAddress) -> Result<(), Fail>;

    /// Adds a secondary MAC address to the port filter.
    fn mac_addr_add(&self, mac: MacAddress) -> Result<(), Fail>;

    /// Removes a secondary MAC address from the port filter.
    fn mac_addr_remove(&self, mac: MacAddress) -> Result<(), Fail>;

    fn promiscuous_enable(&self) -> Result<(), Fail>;

    fn promiscuous_disable(&self) -> Result<(), Fail>;

    fn promiscuous_get(&self) -> bool;

    fn allmulticast_enable(&self) -> Result<(), Fail>;

    fn allmulticast_disable(&self) -> Result<(), Fail>;

    fn allmulticast_get(&self) -> bool;

    fn stats(&self) -> Result<PortStats, Fail>;

    fn stats_reset(&self) -> Result<(), Fail>;

    fn info(&self) -> Result<PortInfo, Fail>;

    /// Configures the number of receive and transmit queues of the port.
    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16) -> Result<(), Fail>;

    fn set_mtu(&self, mtu: u16) -> Result<(), Fail>;

    fn start(&self) -> Result<(), Fail>;

    fn stop(&self) -> Result<(), Fail>;
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Prepares and transmits `pkts` on `port`. Packets rejected by the prepare stage are handled as unsent: on return,
/// `pkts` holds every packet that was not transmitted, in order.
pub fn prepare_and_transmit(port: &dyn PhysicalPort, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
    let nb_prep: usize = port.tx_prepare(queue, pkts).min(pkts.len());
    if nb_prep == pkts.len() {
        return port.tx_burst(queue, pkts);
    }
    let mut rejected: Vec<Mbuf> = pkts.split_off(nb_prep);
    let nb_tx: usize = port.tx_burst(queue, pkts);
    pkts.append(&mut rejected);
    nb_tx
}
