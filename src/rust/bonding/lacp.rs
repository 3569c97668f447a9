// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-member surface shared with the external IEEE 802.3ad state machine. The state machine owns the actor state
//! and produces LACPDUs; the bonding data path consumes the state, drains queued control frames and hands received
//! slow frames back.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    protocols::{
        ethernet2,
        slow::{
            self,
            SLOW_SUBTYPE_LACP,
            SLOW_SUBTYPE_MARKER,
        },
        ETHERNET2_HEADER_SIZE,
    },
    runtime::{
        fail::Fail,
        memory::Mbuf,
        network::types::MacAddress,
    },
};
use ::bitflags::bitflags;
use ::crossbeam_channel::{
    self,
    Receiver,
    Sender,
    TryRecvError,
    TrySendError,
};
use ::std::sync::{
    atomic::{
        AtomicU8,
        Ordering,
    },
    Mutex,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Capacity of the control transmit ring of a member.
pub const LACP_TX_RING_SIZE: usize = 64;

/// Capacity of the slow receive ring of a member.
pub const LACP_RX_RING_SIZE: usize = 64;

/// Offset of the TLV type of a Marker PDU.
const MARKER_TLV_TYPE_OFFSET: usize = ETHERNET2_HEADER_SIZE + 2;
const MARKER_TLV_TYPE_INFO: u8 = 1;
const MARKER_TLV_TYPE_RESP: u8 = 2;

//======================================================================================================================
// Structures
//======================================================================================================================

bitflags! {
    /// Actor state bits of an aggregation port.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ActorState: u8 {
        const LACP_ACTIVE = 0x01;
        const TIMEOUT = 0x02;
        const AGGREGATION = 0x04;
        const SYNCHRONIZATION = 0x08;
        const COLLECTING = 0x10;
        const DISTRIBUTING = 0x20;
        const DEFAULTED = 0x40;
        const EXPIRED = 0x80;
    }
}

/// Outcome of handing a slow frame to a member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlowDelivery {
    /// A LACPDU queued for the state machine.
    Lacpdu,
    /// A Marker request turned into a response and queued for transmission.
    MarkerResponse,
    /// The frame was dropped.
    Dropped,
}

/// 802.3ad state of a member port.
pub struct LacpPort {
    port_id: u16,
    actor_state: AtomicU8,
    actor_system: Mutex<MacAddress>,
    tx_ring: (Sender<Mbuf>, Receiver<Mbuf>),
    rx_ring: (Sender<Mbuf>, Receiver<Mbuf>),
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ActorState {
    /// State of a port that was just activated.
    pub fn initial() -> Self {
        ActorState::AGGREGATION | ActorState::LACP_ACTIVE | ActorState::DEFAULTED
    }
}

impl LacpPort {
    pub fn new(port_id: u16) -> Self {
        Self {
            port_id,
            actor_state: AtomicU8::new(0),
            actor_system: Mutex::new(MacAddress::nil()),
            tx_ring: crossbeam_channel::bounded(LACP_TX_RING_SIZE),
            rx_ring: crossbeam_channel::bounded(LACP_RX_RING_SIZE),
        }
    }

    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    pub fn actor_state(&self) -> ActorState {
        ActorState::from_bits_retain(self.actor_state.load(Ordering::Acquire))
    }

    pub fn set_actor_state(&self, state: ActorState) {
        self.actor_state.store(state.bits(), Ordering::Release);
    }

    pub fn insert_actor_state(&self, state: ActorState) {
        self.actor_state.fetch_or(state.bits(), Ordering::AcqRel);
    }

    pub fn remove_actor_state(&self, state: ActorState) {
        self.actor_state.fetch_and(!state.bits(), Ordering::AcqRel);
    }

    pub fn is_collecting(&self) -> bool {
        self.actor_state().contains(ActorState::COLLECTING)
    }

    pub fn is_distributing(&self) -> bool {
        self.actor_state().contains(ActorState::DISTRIBUTING)
    }

    pub fn actor_system(&self) -> MacAddress {
        match self.actor_system.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_actor_system(&self, mac: MacAddress) {
        match self.actor_system.lock() {
            Ok(mut guard) => *guard = mac,
            Err(poisoned) => *poisoned.into_inner() = mac,
        }
    }

    /// Prepares the port to join an aggregation.
    pub fn activate(&self, system: MacAddress) {
        self.set_actor_state(ActorState::initial());
        self.set_actor_system(system);
    }

    /// Takes the port out of any aggregation and discards pending frames.
    pub fn deactivate(&self) {
        self.set_actor_state(ActorState::empty());
        self.drain();
    }

    /// Queues a control frame for transmission by the data path.
    pub fn enqueue_ctrl_tx(&self, pkt: Mbuf) -> Result<(), Fail> {
        match self.tx_ring.0.try_send(pkt) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let cause: String = format!("control ring full (port_id={})", self.port_id);
                warn!("enqueue_ctrl_tx(): {}", cause);
                Err(Fail::new(libc::ENOBUFS, &cause))
            },
        }
    }

    /// Takes the next pending control frame.
    pub fn dequeue_ctrl_tx(&self) -> Option<Mbuf> {
        match self.tx_ring.1.try_recv() {
            Ok(pkt) => Some(pkt),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Returns a control frame that could not be sent to the ring, so that it is retried on the next burst.
    pub(crate) fn requeue_ctrl_tx(&self, pkt: Mbuf) {
        if self.tx_ring.0.try_send(pkt).is_err() {
            warn!("requeue_ctrl_tx(): control ring full, dropping frame (port_id={})", self.port_id);
        }
    }

    /// Takes the next slow frame received on this port.
    pub fn dequeue_slow_rx(&self) -> Option<Mbuf> {
        match self.rx_ring.1.try_recv() {
            Ok(pkt) => Some(pkt),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn pending_ctrl_tx(&self) -> usize {
        self.tx_ring.1.len()
    }

    pub fn pending_slow_rx(&self) -> usize {
        self.rx_ring.1.len()
    }

    /// Handles a slow frame removed from the receive path. LACPDUs go to the state machine; Marker information
    /// requests are answered from this port's address.
    pub(crate) fn handle_slow_frame(&self, mut pkt: Mbuf, port_mac: MacAddress) -> SlowDelivery {
        match slow::subtype(&pkt) {
            Some(SLOW_SUBTYPE_LACP) => match self.rx_ring.0.try_send(pkt) {
                Ok(()) => SlowDelivery::Lacpdu,
                Err(_) => {
                    warn!("handle_slow_frame(): slow ring full (port_id={})", self.port_id);
                    SlowDelivery::Dropped
                },
            },
            Some(SLOW_SUBTYPE_MARKER) if pkt.get(MARKER_TLV_TYPE_OFFSET) == Some(&MARKER_TLV_TYPE_INFO) => {
                pkt[MARKER_TLV_TYPE_OFFSET] = MARKER_TLV_TYPE_RESP;
                // The destination is the slow protocols group address and is left as is.
                ethernet2::set_src_addr(&mut pkt, port_mac);
                match self.tx_ring.0.try_send(pkt) {
                    Ok(()) => SlowDelivery::MarkerResponse,
                    Err(_) => {
                        warn!("handle_slow_frame(): control ring full (port_id={})", self.port_id);
                        SlowDelivery::Dropped
                    },
                }
            },
            subtype => {
                debug!("handle_slow_frame(): dropping slow frame (subtype={:?})", subtype);
                SlowDelivery::Dropped
            },
        }
    }

    /// Discards every pending frame, in both directions.
    pub fn drain(&self) {
        while self.tx_ring.1.try_recv().is_ok() {}
        while self.rx_ring.1.try_recv().is_ok() {}
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ensure_eq,
        protocols::{
            slow::SLOW_PROTOCOLS_MULTICAST,
            FrameBuilder,
        },
    };
    use ::anyhow::Result;

    const PORT_MAC: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x10]);
    const PEER_MAC: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x20]);

    fn slow_frame(subtype: u8) -> Mbuf {
        FrameBuilder::new(MacAddress::new(SLOW_PROTOCOLS_MULTICAST), PEER_MAC)
            .slow(subtype)
            .build()
    }

    #[test]
    fn actor_state_bits() -> Result<()> {
        let port: LacpPort = LacpPort::new(1);
        ensure_eq!(port.actor_state(), ActorState::empty());
        port.activate(PORT_MAC);
        ensure_eq!(port.actor_state(), ActorState::initial());
        ensure_eq!(port.actor_system(), PORT_MAC);
        port.insert_actor_state(ActorState::COLLECTING | ActorState::DISTRIBUTING);
        ensure_eq!(port.is_collecting(), true);
        port.remove_actor_state(ActorState::DISTRIBUTING);
        ensure_eq!(port.is_distributing(), false);
        port.deactivate();
        ensure_eq!(port.actor_state(), ActorState::empty());
        Ok(())
    }

    #[test]
    fn lacpdu_goes_to_slow_ring() -> Result<()> {
        let port: LacpPort = LacpPort::new(1);
        ensure_eq!(port.handle_slow_frame(slow_frame(SLOW_SUBTYPE_LACP), PORT_MAC), SlowDelivery::Lacpdu);
        ensure_eq!(port.pending_slow_rx(), 1);
        ensure_eq!(port.pending_ctrl_tx(), 0);
        ensure_eq!(port.dequeue_slow_rx().is_some(), true);
        ensure_eq!(port.handle_slow_frame(slow_frame(9), PORT_MAC), SlowDelivery::Dropped);
        Ok(())
    }

    #[test]
    fn marker_request_is_answered() -> Result<()> {
        let port: LacpPort = LacpPort::new(1);
        let mut request: Mbuf = slow_frame(SLOW_SUBTYPE_MARKER);
        request[MARKER_TLV_TYPE_OFFSET] = MARKER_TLV_TYPE_INFO;
        ensure_eq!(port.handle_slow_frame(request, PORT_MAC), SlowDelivery::MarkerResponse);
        let response: Mbuf = port.dequeue_ctrl_tx().ok_or(anyhow::anyhow!("no marker response"))?;
        ensure_eq!(response[MARKER_TLV_TYPE_OFFSET], MARKER_TLV_TYPE_RESP);
        ensure_eq!(ethernet2::src_addr(&response), Some(PORT_MAC));

        // Responses are not answered.
        ensure_eq!(port.handle_slow_frame(response, PORT_MAC), SlowDelivery::Dropped);
        Ok(())
    }

    #[test]
    fn control_ring_is_bounded() -> Result<()> {
        let port: LacpPort = LacpPort::new(1);
        for _ in 0..LACP_TX_RING_SIZE {
            port.enqueue_ctrl_tx(slow_frame(SLOW_SUBTYPE_LACP))?;
        }
        ensure_eq!(port.enqueue_ctrl_tx(slow_frame(SLOW_SUBTYPE_LACP)).is_err(), true);
        port.drain();
        ensure_eq!(port.pending_ctrl_tx(), 0);
        Ok(())
    }
}
