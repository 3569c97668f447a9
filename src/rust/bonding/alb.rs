// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Adaptive load balancing. Besides ranking members for transmission, the bond answers ARP on behalf of the
//! application so that each peer learns the MAC address of a different member. The client table keeps one entry per
//! hash of the peer IPv4 address.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        BondView,
        MemberHandle,
    },
    protocols::{
        arp::{
            ArpHeader,
            ArpOperation,
            ARP_MESSAGE_SIZE,
        },
        ethernet2::{
            self,
            EtherType2,
            ETHERNET2_HEADER_SIZE,
        },
    },
    runtime::{
        memory::{
            Mbuf,
            MbufPool,
        },
        network::types::MacAddress,
    },
};
use ::arrayvec::ArrayVec;
use ::std::{
    net::Ipv4Addr,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of entries in the client table.
pub const ALB_HASH_TABLE_SIZE: usize = 256;

/// Bytes between the source MAC address and the network header: the tag headers plus the innermost EtherType.
const L2_TAIL_MAX_SIZE: usize = 10;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A peer the bond answered ARP for.
#[derive(Clone, Debug)]
pub(crate) struct ClientData {
    pub in_use: bool,
    /// Address of the application behind the bond.
    pub app_ip: Ipv4Addr,
    pub app_mac: MacAddress,
    /// Address of the peer.
    pub cli_ip: Ipv4Addr,
    pub cli_mac: MacAddress,
    /// Member the peer is assigned to.
    pub member: u16,
    /// Tag headers seen in the last exchange with the peer, followed by the ARP EtherType.
    pub l2_tail: ArrayVec<u8, L2_TAIL_MAX_SIZE>,
}

struct AlbState {
    clients: Vec<ClientData>,
    /// Index in the active list of the last assigned member.
    last_member: Option<usize>,
}

pub(crate) struct Alb {
    state: Mutex<AlbState>,
    /// Clients must be told about a new assignment.
    ntt: AtomicBool,
    pool: MbufPool,
}

/// ARP message located in a frame.
struct ArpFrame {
    pdu: ArpHeader,
    /// Offset of the ARP message.
    offset: usize,
    l2_tail: ArrayVec<u8, L2_TAIL_MAX_SIZE>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ClientData {
    fn unused() -> Self {
        Self {
            in_use: false,
            app_ip: Ipv4Addr::UNSPECIFIED,
            app_mac: MacAddress::nil(),
            cli_ip: Ipv4Addr::UNSPECIFIED,
            cli_mac: MacAddress::nil(),
            member: 0,
            l2_tail: ArrayVec::new(),
        }
    }
}

impl Alb {
    pub fn new(pool: MbufPool) -> Self {
        Self {
            state: Mutex::new(AlbState {
                clients: vec![ClientData::unused(); ALB_HASH_TABLE_SIZE],
                last_member: None,
            }),
            ntt: AtomicBool::new(false),
            pool,
        }
    }

    fn lock(&self) -> MutexGuard<AlbState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Forgets every client.
    pub fn reset(&self) {
        let mut state: MutexGuard<AlbState> = self.lock();
        state.clients.iter_mut().for_each(|client| *client = ClientData::unused());
        state.last_member = None;
        self.ntt.store(false, Ordering::Release);
    }

    /// Snapshot of the client entry at `index`.
    pub fn client(&self, index: usize) -> Option<ClientData> {
        self.lock().clients.get(index).cloned()
    }

    pub fn clients_in_use(&self) -> usize {
        self.lock().clients.iter().filter(|client| client.in_use).count()
    }

    pub fn pool(&self) -> &MbufPool {
        &self.pool
    }

    /// Takes the pending refresh request.
    pub fn take_ntt(&self) -> bool {
        self.ntt.swap(false, Ordering::AcqRel)
    }

    pub fn ntt(&self) -> bool {
        self.ntt.load(Ordering::Acquire)
    }

    /// Learns from an ARP reply received by the bond. The target hardware address of the reply is rewritten to the
    /// member that now serves the peer.
    pub fn arp_recv(&self, frame: &mut [u8], view: &BondView) {
        let arp: ArpFrame = match locate_arp(frame) {
            Some(arp) => arp,
            None => return,
        };
        if arp.pdu.get_operation() != ArpOperation::Reply {
            return;
        }
        let index: usize = simple_hash(arp.pdu.get_sender_protocol_addr());
        let mut state: MutexGuard<AlbState> = self.lock();
        let stale: bool = {
            let client: &ClientData = &state.clients[index];
            !client.in_use
                || client.app_ip != arp.pdu.get_destination_protocol_addr()
                || client.cli_ip != arp.pdu.get_sender_protocol_addr()
                || client.cli_mac != arp.pdu.get_sender_hardware_addr()
                || client.l2_tail != arp.l2_tail
        };
        if stale {
            if let Some(member) = calculate_member(&mut state.last_member, &view.active) {
                let app_mac: MacAddress = member.mac_addr();
                let client: &mut ClientData = &mut state.clients[index];
                client.in_use = true;
                client.app_ip = arp.pdu.get_destination_protocol_addr();
                client.cli_ip = arp.pdu.get_sender_protocol_addr();
                client.cli_mac = arp.pdu.get_sender_hardware_addr();
                client.member = member.port_id;
                client.app_mac = app_mac;
                client.l2_tail = arp.l2_tail.clone();
                let mut pdu: ArpHeader = arp.pdu.clone();
                pdu.set_target_hardware_addr(app_mac);
                write_arp(frame, arp.offset, &pdu);
                debug!("arp_recv(): client {} assigned to port {}", client.cli_ip, client.member);
            }
        }
        self.ntt.store(true, Ordering::Release);
    }

    /// Chooses the member that transmits an ARP frame and rewrites its sender hardware address. Returns `None` if
    /// there is no active member.
    pub fn arp_xmit(&self, frame: &mut [u8], view: &BondView) -> Option<MemberHandle> {
        let primary: MemberHandle = view.primary.clone().or_else(|| view.active.first().cloned())?;
        let mut arp: ArpFrame = locate_arp(frame)?;
        let bond_mac: MacAddress = view.mac_addrs.first().copied().unwrap_or_else(MacAddress::nil);

        // Frames the application did not send from the bond address go out unchanged on the primary.
        if arp.pdu.get_sender_hardware_addr() != bond_mac || arp.pdu.get_operation() != ArpOperation::Reply {
            arp.pdu.set_sender_hardware_addr(primary.mac_addr());
            write_arp(frame, arp.offset, &arp.pdu);
            return Some(primary);
        }

        let index: usize = simple_hash(arp.pdu.get_destination_protocol_addr());
        let mut state: MutexGuard<AlbState> = self.lock();
        let known: bool = {
            let client: &ClientData = &state.clients[index];
            client.in_use
                && client.app_ip == arp.pdu.get_sender_protocol_addr()
                && client.cli_ip == arp.pdu.get_destination_protocol_addr()
        };
        let member: MemberHandle = if known {
            let member: MemberHandle = match view.member(state.clients[index].member) {
                Some(member) => member.clone(),
                None => primary,
            };
            let client: &mut ClientData = &mut state.clients[index];
            if !arp.pdu.get_target_hardware_addr().is_broadcast() {
                client.cli_mac = arp.pdu.get_target_hardware_addr();
            }
            client.app_mac = member.mac_addr();
            client.l2_tail = arp.l2_tail.clone();
            member
        } else {
            let member: MemberHandle = match calculate_member(&mut state.last_member, &view.active) {
                Some(member) => member,
                None => primary,
            };
            let client: &mut ClientData = &mut state.clients[index];
            client.in_use = true;
            client.app_ip = arp.pdu.get_sender_protocol_addr();
            client.cli_mac = arp.pdu.get_target_hardware_addr();
            client.cli_ip = arp.pdu.get_destination_protocol_addr();
            client.member = member.port_id;
            client.app_mac = member.mac_addr();
            client.l2_tail = arp.l2_tail.clone();
            member
        };
        arp.pdu.set_sender_hardware_addr(member.mac_addr());
        write_arp(frame, arp.offset, &arp.pdu);
        Some(member)
    }

    /// Reassigns every known client over the active members and schedules a refresh.
    pub fn client_list_update(&self, view: &BondView) {
        if view.active.is_empty() {
            return;
        }
        let mut state: MutexGuard<AlbState> = self.lock();
        state.last_member = None;
        let mut updated: bool = false;
        for index in 0..state.clients.len() {
            if !state.clients[index].in_use {
                continue;
            }
            if let Some(member) = calculate_member(&mut state.last_member, &view.active) {
                let client: &mut ClientData = &mut state.clients[index];
                client.member = member.port_id;
                client.app_mac = member.mac_addr();
                updated = true;
            }
        }
        if updated {
            self.ntt.store(true, Ordering::Release);
        }
    }

    /// Builds one gratuitous ARP reply per known client, telling it which member serves it. Returns the packets
    /// along with the member that must send each of them.
    pub fn build_updates(&self) -> Vec<(u16, Mbuf)> {
        let state: MutexGuard<AlbState> = self.lock();
        let mut updates: Vec<(u16, Mbuf)> = Vec::new();
        for client in state.clients.iter().filter(|client| client.in_use) {
            let len: usize = 2 * 6 + client.l2_tail.len() + ARP_MESSAGE_SIZE;
            let mut pkt: Mbuf = match self.pool.alloc(len) {
                Ok(pkt) => pkt,
                Err(e) => {
                    warn!("build_updates(): cannot allocate ARP update ({:?})", e);
                    continue;
                },
            };
            pkt[0..6].copy_from_slice(&client.cli_mac.octets());
            pkt[6..12].copy_from_slice(&client.app_mac.octets());
            pkt[12..12 + client.l2_tail.len()].copy_from_slice(&client.l2_tail);
            let pdu: ArpHeader = ArpHeader::new(
                ArpOperation::Reply,
                client.app_mac,
                client.app_ip,
                client.cli_mac,
                client.cli_ip,
            );
            write_arp(&mut pkt, 12 + client.l2_tail.len(), &pdu);
            updates.push((client.member, pkt));
        }
        updates
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Folds an IPv4 address into a client table index.
pub fn simple_hash(addr: Ipv4Addr) -> usize {
    addr.octets().iter().fold(0u8, |hash, byte| hash ^ byte) as usize
}

/// Assigns the next active member, round-robin.
fn calculate_member(last_member: &mut Option<usize>, active: &[MemberHandle]) -> Option<MemberHandle> {
    if active.is_empty() {
        return None;
    }
    let index: usize = match *last_member {
        Some(last) => (last + 1) % active.len(),
        None => 0,
    };
    *last_member = Some(index);
    active.get(index).cloned()
}

/// Returns `true` if `frame` carries ARP, possibly behind VLAN tags.
pub fn is_arp(frame: &[u8]) -> bool {
    matches!(ethernet2::vlan_offset(frame), Some((_, proto)) if proto == EtherType2::Arp as u16)
}

fn locate_arp(frame: &[u8]) -> Option<ArpFrame> {
    let (vlan_offset, proto): (usize, u16) = ethernet2::vlan_offset(frame)?;
    if proto != EtherType2::Arp as u16 {
        return None;
    }
    let offset: usize = ETHERNET2_HEADER_SIZE + vlan_offset;
    let pdu: ArpHeader = ArpHeader::parse(frame.get(offset..)?).ok()?;
    let mut l2_tail: ArrayVec<u8, L2_TAIL_MAX_SIZE> = ArrayVec::new();
    l2_tail.try_extend_from_slice(&frame[12..offset]).ok()?;
    Some(ArpFrame { pdu, offset, l2_tail })
}

fn write_arp(frame: &mut [u8], offset: usize, pdu: &ArpHeader) {
    if let Some(buf) = frame.get_mut(offset..) {
        if let Err(e) = pdu.serialize(buf) {
            warn!("write_arp(): {:?}", e);
        }
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
        protocols::FrameBuilder,
    };
    use ::anyhow::Result;

    #[test]
    fn hash_folds_octets() -> Result<()> {
        ensure_eq!(simple_hash(Ipv4Addr::new(10, 0, 0, 1)), 11);
        ensure_eq!(simple_hash(Ipv4Addr::new(1, 1, 1, 1)), 0);
        ensure_eq!(simple_hash(Ipv4Addr::new(255, 0, 0, 0)), 255);
        Ok(())
    }

    #[test]
    fn tagged_arp_keeps_its_tags() -> Result<()> {
        let pdu: ArpHeader = ArpHeader::new(
            ArpOperation::Request,
            MacAddress::new([2, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(10, 0, 0, 1),
            MacAddress::nil(),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        let frame: Vec<u8> = FrameBuilder::new(MacAddress::broadcast(), MacAddress::new([2, 0, 0, 0, 0, 1]))
            .vlan(7)
            .arp(pdu.clone())
            .to_bytes();
        ensure_eq!(is_arp(&frame), true);
        let arp: ArpFrame = locate_arp(&frame).ok_or(anyhow::anyhow!("no ARP message"))?;
        ensure_eq!(arp.offset, 18);
        ensure_eq!(arp.pdu, pdu);
        ensure_eq!(arp.l2_tail.as_slice(), &[0x81, 0x00, 0x00, 0x07, 0x08, 0x06]);
        Ok(())
    }

    #[test]
    fn reset_forgets_clients() -> Result<()> {
        let alb: Alb = Alb::new(MbufPool::new("test_alb", 4));
        alb.lock().clients[3].in_use = true;
        alb.ntt.store(true, Ordering::Release);
        ensure_eq!(alb.clients_in_use(), 1);
        alb.reset();
        ensure_eq!(alb.clients_in_use(), 0);
        ensure_eq!(alb.ntt(), false);
        ensure_eq!(alb.build_updates().len(), 0);
        Ok(())
    }
}
