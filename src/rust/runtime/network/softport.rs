// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::Mbuf,
    network::{
        consts::DEFAULT_MTU,
        types::MacAddress,
        LinkStatus,
        LscCallback,
        PhysicalPort,
        PortInfo,
        PortStats,
    },
};
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

const SOFTPORT_MAX_QUEUES: u16 = 16;
const SOFTPORT_MAX_MAC_ADDRS: usize = 16;
const SOFTPORT_MAX_RX_PKTLEN: u32 = 9618;

//======================================================================================================================
// Structures
//======================================================================================================================

struct SoftPortState {
    mac: MacAddress,
    secondary_macs: Vec<MacAddress>,
    max_mac_addrs: usize,
    incoming: VecDeque<Mbuf>,
    outgoing: VecDeque<Mbuf>,
    /// Maximum number of packets accepted by a single transmit burst.
    tx_limit: Option<usize>,
    /// Maximum number of packets handed out by a single receive burst.
    rx_limit: Option<usize>,
    link: LinkStatus,
    link_query_fails: bool,
    lsc_interrupt: bool,
    lsc_callbacks: Vec<(u64, LscCallback)>,
    next_callback_token: u64,
    promiscuous: bool,
    promiscuous_fails: bool,
    allmulticast: bool,
    stats: PortStats,
    started: bool,
    nb_rx_queues: u16,
    nb_tx_queues: u16,
    mtu: u16,
    mtu_supported: bool,
}

/// A software port backed by in-memory queues. Received packets are injected with [SoftPort::push_rx] and
/// transmitted packets are collected with [SoftPort::take_tx]. Transmit capacity, link state and a few failures can be
/// programmed to exercise the bonding layer.
pub struct SoftPort {
    port_id: u16,
    state: Mutex<SoftPortState>,
    rx_calls: AtomicUsize,
    tx_calls: AtomicUsize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SoftPort {
    /// Creates a port whose link is up at `speed_mbps`, able to raise link-status-change interrupts.
    pub fn new(port_id: u16, mac: MacAddress, speed_mbps: u32) -> Arc<Self> {
        Arc::new(Self {
            port_id,
            state: Mutex::new(SoftPortState {
                mac,
                secondary_macs: Vec::new(),
                max_mac_addrs: SOFTPORT_MAX_MAC_ADDRS,
                incoming: VecDeque::new(),
                outgoing: VecDeque::new(),
                tx_limit: None,
                rx_limit: None,
                link: LinkStatus::up(speed_mbps),
                link_query_fails: false,
                lsc_interrupt: true,
                lsc_callbacks: Vec::new(),
                next_callback_token: 0,
                promiscuous: false,
                promiscuous_fails: false,
                allmulticast: false,
                stats: PortStats::default(),
                started: false,
                nb_rx_queues: 1,
                nb_tx_queues: 1,
                mtu: DEFAULT_MTU,
                mtu_supported: true,
            }),
            rx_calls: AtomicUsize::new(0),
            tx_calls: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<SoftPortState> {
        // A panic in a test thread should not hide the state from the other threads.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queues a packet for reception.
    pub fn push_rx(&self, mut pkt: Mbuf) {
        pkt.set_port(self.port_id);
        self.lock().incoming.push_back(pkt);
    }

    /// Number of packets waiting to be received.
    pub fn rx_pending(&self) -> usize {
        self.lock().incoming.len()
    }

    /// Removes and returns all packets transmitted so far.
    pub fn take_tx(&self) -> Vec<Mbuf> {
        self.lock().outgoing.drain(..).collect()
    }

    /// Number of packets transmitted and not yet taken.
    pub fn tx_len(&self) -> usize {
        self.lock().outgoing.len()
    }

    pub fn set_tx_limit(&self, limit: Option<usize>) {
        self.lock().tx_limit = limit;
    }

    pub fn set_rx_limit(&self, limit: Option<usize>) {
        self.lock().rx_limit = limit;
    }

    /// Changes the link status, raising a link-status-change interrupt if the port supports them.
    pub fn set_link(&self, link: LinkStatus) {
        let callbacks: Vec<LscCallback> = {
            let mut state: MutexGuard<SoftPortState> = self.lock();
            if state.link == link {
                return;
            }
            state.link = link;
            if !state.lsc_interrupt {
                return;
            }
            state.lsc_callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };
        debug!("set_link(): port {} link {}", self.port_id, link);
        for callback in callbacks {
            callback(self.port_id);
        }
    }

    pub fn set_link_up(&self, speed_mbps: u32) {
        self.set_link(LinkStatus::up(speed_mbps));
    }

    pub fn set_link_down(&self) {
        self.set_link(LinkStatus::down());
    }

    /// Makes the port raise (or not) link-status-change interrupts. Ports without interrupts must be polled.
    pub fn set_lsc_interrupt(&self, enabled: bool) {
        self.lock().lsc_interrupt = enabled;
    }

    /// Makes link queries fail.
    pub fn set_link_query_failure(&self, fails: bool) {
        self.lock().link_query_fails = fails;
    }

    /// Makes promiscuous mode changes fail.
    pub fn set_promiscuous_failure(&self, fails: bool) {
        self.lock().promiscuous_fails = fails;
    }

    pub fn set_max_mac_addrs(&self, max_mac_addrs: usize) {
        self.lock().max_mac_addrs = max_mac_addrs;
    }

    pub fn set_mtu_supported(&self, supported: bool) {
        self.lock().mtu_supported = supported;
    }

    /// Adds transmitted bytes to the port counters, as traffic from outside the bonding layer would.
    pub fn account_tx_bytes(&self, bytes: u64) {
        self.lock().stats.obytes += bytes;
    }

    pub fn secondary_macs(&self) -> Vec<MacAddress> {
        self.lock().secondary_macs.clone()
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// Returns the configured number of receive and transmit queues.
    pub fn queues(&self) -> (u16, u16) {
        let state: MutexGuard<SoftPortState> = self.lock();
        (state.nb_rx_queues, state.nb_tx_queues)
    }

    pub fn mtu(&self) -> u16 {
        self.lock().mtu
    }

    /// Number of receive bursts issued on this port.
    pub fn rx_calls(&self) -> usize {
        self.rx_calls.load(Ordering::Relaxed)
    }

    /// Number of transmit bursts issued on this port.
    pub fn tx_calls(&self) -> usize {
        self.tx_calls.load(Ordering::Relaxed)
    }

    pub fn lsc_callback_count(&self) -> usize {
        self.lock().lsc_callbacks.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PhysicalPort for SoftPort {
    fn port_id(&self) -> u16 {
        self.port_id
    }

    fn rx_burst(&self, _queue: u16, pkts: &mut Vec<Mbuf>, max: usize) -> usize {
        self.rx_calls.fetch_add(1, Ordering::Relaxed);
        let mut state: MutexGuard<SoftPortState> = self.lock();
        let nb_rx: usize = state
            .incoming
            .len()
            .min(max)
            .min(state.rx_limit.unwrap_or(usize::MAX));
        for _ in 0..nb_rx {
            if let Some(pkt) = state.incoming.pop_front() {
                state.stats.ipackets += 1;
                state.stats.ibytes += pkt.len() as u64;
                pkts.push(pkt);
            }
        }
        nb_rx
    }

    fn tx_burst(&self, _queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        self.tx_calls.fetch_add(1, Ordering::Relaxed);
        let mut state: MutexGuard<SoftPortState> = self.lock();
        if !state.link.up {
            return 0;
        }
        let nb_tx: usize = pkts.len().min(state.tx_limit.unwrap_or(usize::MAX));
        for pkt in pkts.drain(..nb_tx) {
            state.stats.opackets += 1;
            state.stats.obytes += pkt.len() as u64;
            state.outgoing.push_back(pkt);
        }
        trace!("tx_burst(): port {} sent {} packets", self.port_id, nb_tx);
        nb_tx
    }

    fn link_get(&self) -> Result<LinkStatus, Fail> {
        self.link_get_nowait()
    }

    fn link_get_nowait(&self) -> Result<LinkStatus, Fail> {
        let state: MutexGuard<SoftPortState> = self.lock();
        if state.link_query_fails {
            return Err(Fail::new(libc::EIO, "link query failed"));
        }
        Ok(state.link)
    }

    fn supports_lsc_interrupt(&self) -> bool {
        self.lock().lsc_interrupt
    }

    fn register_lsc_callback(&self, callback: LscCallback) -> Result<u64, Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        let token: u64 = state.next_callback_token;
        state.next_callback_token += 1;
        state.lsc_callbacks.push((token, callback));
        Ok(token)
    }

    fn unregister_lsc_callback(&self, token: u64) -> Result<(), Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        match state.lsc_callbacks.iter().position(|(t, _)| *t == token) {
            Some(index) => {
                state.lsc_callbacks.remove(index);
                Ok(())
            },
            None => Err(Fail::new(libc::ENOENT, "no such callback")),
        }
    }

    fn mac_addr(&self) -> MacAddress {
        self.lock().mac
    }

    fn set_default_mac_addr(&self, mac: MacAddress) -> Result<(), Fail> {
        if mac.is_multicast() {
            let cause: String = format!("invalid default MAC address {}", mac);
            error!("set_default_mac_addr(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.lock().mac = mac;
        Ok(())
    }

    fn mac_addr_add(&self, mac: MacAddress) -> Result<(), Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        if state.mac == mac || state.secondary_macs.contains(&mac) {
            return Ok(());
        }
        // The default address takes one slot.
        if state.secondary_macs.len() + 1 >= state.max_mac_addrs {
            return Err(Fail::new(libc::ENOSPC, "MAC address filter is full"));
        }
        state.secondary_macs.push(mac);
        Ok(())
    }

    fn mac_addr_remove(&self, mac: MacAddress) -> Result<(), Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        match state.secondary_macs.iter().position(|m| *m == mac) {
            Some(index) => {
                state.secondary_macs.remove(index);
                Ok(())
            },
            None => Err(Fail::new(libc::ENOENT, "MAC address not in filter")),
        }
    }

    fn promiscuous_enable(&self) -> Result<(), Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        if state.promiscuous_fails {
            return Err(Fail::new(libc::EIO, "cannot change promiscuous mode"));
        }
        state.promiscuous = true;
        Ok(())
    }

    fn promiscuous_disable(&self) -> Result<(), Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        if state.promiscuous_fails {
            return Err(Fail::new(libc::EIO, "cannot change promiscuous mode"));
        }
        state.promiscuous = false;
        Ok(())
    }

    fn promiscuous_get(&self) -> bool {
        self.lock().promiscuous
    }

    fn allmulticast_enable(&self) -> Result<(), Fail> {
        self.lock().allmulticast = true;
        Ok(())
    }

    fn allmulticast_disable(&self) -> Result<(), Fail> {
        self.lock().allmulticast = false;
        Ok(())
    }

    fn allmulticast_get(&self) -> bool {
        self.lock().allmulticast
    }

    fn stats(&self) -> Result<PortStats, Fail> {
        Ok(self.lock().stats)
    }

    fn stats_reset(&self) -> Result<(), Fail> {
        self.lock().stats = PortStats::default();
        Ok(())
    }

    fn info(&self) -> Result<PortInfo, Fail> {
        let state: MutexGuard<SoftPortState> = self.lock();
        Ok(PortInfo {
            max_rx_queues: SOFTPORT_MAX_QUEUES,
            max_tx_queues: SOFTPORT_MAX_QUEUES,
            max_rx_pktlen: SOFTPORT_MAX_RX_PKTLEN,
            max_mac_addrs: state.max_mac_addrs as u32,
        })
    }

    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16) -> Result<(), Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        if state.started {
            return Err(Fail::new(libc::EBUSY, "port must be stopped"));
        }
        if nb_rx_queues > SOFTPORT_MAX_QUEUES || nb_tx_queues > SOFTPORT_MAX_QUEUES {
            let cause: String = format!(
                "too many queues (nb_rx_queues={}, nb_tx_queues={})",
                nb_rx_queues, nb_tx_queues
            );
            error!("configure(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        state.nb_rx_queues = nb_rx_queues;
        state.nb_tx_queues = nb_tx_queues;
        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> Result<(), Fail> {
        let mut state: MutexGuard<SoftPortState> = self.lock();
        if !state.mtu_supported {
            return Err(Fail::new(libc::ENOTSUP, "MTU cannot be changed"));
        }
        state.mtu = mtu;
        Ok(())
    }

    fn start(&self) -> Result<(), Fail> {
        self.lock().started = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), Fail> {
        self.lock().started = false;
        Ok(())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::SoftPort;
    use crate::{
        ensure_eq,
        runtime::{
            memory::Mbuf,
            network::{
                types::MacAddress,
                PhysicalPort,
            },
        },
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    const MAC: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 1]);

    #[test]
    fn tx_limit_leaves_unsent_packets_in_order() -> Result<()> {
        let port: Arc<SoftPort> = SoftPort::new(0, MAC, 10_000);
        port.set_tx_limit(Some(2));
        let mut pkts: Vec<Mbuf> = (0..4u8).map(|i| Mbuf::from_slice(&[i])).collect();
        ensure_eq!(port.tx_burst(0, &mut pkts), 2);
        ensure_eq!(pkts.len(), 2);
        ensure_eq!(pkts[0][0], 2);
        ensure_eq!(pkts[1][0], 3);
        ensure_eq!(port.stats()?.opackets, 2);
        Ok(())
    }

    #[test]
    fn link_change_raises_registered_callbacks() -> Result<()> {
        let port: Arc<SoftPort> = SoftPort::new(7, MAC, 10_000);
        let events: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let counter: Arc<AtomicUsize> = events.clone();
        let token: u64 = port.register_lsc_callback(Arc::new(move |port_id: u16| {
            assert_eq!(port_id, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        }))?;
        port.set_link_down();
        // Unchanged link does not raise an event.
        port.set_link_down();
        ensure_eq!(events.load(Ordering::SeqCst), 1);

        port.unregister_lsc_callback(token)?;
        port.set_link_up(10_000);
        ensure_eq!(events.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn rx_limit_caps_each_burst() -> Result<()> {
        let port: Arc<SoftPort> = SoftPort::new(3, MAC, 10_000);
        port.set_rx_limit(Some(1));
        port.push_rx(Mbuf::new(60));
        port.push_rx(Mbuf::new(60));
        let mut pkts: Vec<Mbuf> = Vec::new();
        ensure_eq!(port.rx_burst(0, &mut pkts, 32), 1);
        ensure_eq!(pkts[0].port(), 3);
        ensure_eq!(port.rx_pending(), 1);
        Ok(())
    }
}
