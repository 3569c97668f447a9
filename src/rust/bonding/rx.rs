// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Receive burst functions. Each one reads the snapshot it is given and appends received packets to `pkts`.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        alb,
        BondInner,
        BondView,
        MemberHandle,
    },
    protocols::{
        ethernet2,
        slow,
    },
    runtime::{
        memory::Mbuf,
        network::types::MacAddress,
    },
};
use ::std::sync::atomic::{
    AtomicUsize,
    Ordering,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Polls active members in turn, starting from the member after the one this queue started from last time.
pub(crate) fn rx_burst_round_robin(
    view: &BondView,
    queue: u16,
    cursor: &AtomicUsize,
    pkts: &mut Vec<Mbuf>,
    nb_pkts: usize,
) -> usize {
    let count: usize = view.active.len();
    if count == 0 || nb_pkts == 0 {
        return 0;
    }
    let start: usize = match cursor.load(Ordering::Relaxed) {
        idx if idx < count => idx,
        _ => 0,
    };
    let mut idx: usize = start;
    let mut nb_rx: usize = 0;
    for _ in 0..count {
        if nb_rx >= nb_pkts {
            break;
        }
        nb_rx += view.active[idx].port.rx_burst(queue, pkts, nb_pkts - nb_rx);
        idx = (idx + 1) % count;
    }
    cursor.store((start + 1) % count, Ordering::Relaxed);
    nb_rx
}

/// Receives from the current primary only.
pub(crate) fn rx_burst_active_backup(view: &BondView, queue: u16, pkts: &mut Vec<Mbuf>, nb_pkts: usize) -> usize {
    if view.active.is_empty() {
        return 0;
    }
    match view.primary {
        Some(ref primary) => primary.port.rx_burst(queue, pkts, nb_pkts),
        None => 0,
    }
}

/// Polls like [rx_burst_round_robin], then filters what the aggregation must not deliver: slow frames (unless they
/// have a queue of their own), everything from a member that is not collecting, and frames for another station.
/// Slow frames removed here are handed to the member.
pub(crate) fn rx_burst_lacp(
    view: &BondView,
    queue: u16,
    cursor: &AtomicUsize,
    pkts: &mut Vec<Mbuf>,
    nb_pkts: usize,
    dedicated_queues: bool,
) -> usize {
    let count: usize = view.active.len();
    if count == 0 || nb_pkts == 0 {
        return 0;
    }
    let start: usize = match cursor.load(Ordering::Relaxed) {
        idx if idx < count => idx,
        _ => 0,
    };
    let mut idx: usize = start;
    let mut nb_rx: usize = 0;
    for _ in 0..count {
        if nb_rx >= nb_pkts {
            break;
        }
        let member: &MemberHandle = &view.active[idx];
        let collecting: bool = member.lacp.is_collecting();
        let first: usize = pkts.len();
        member.port.rx_burst(queue, pkts, nb_pkts - nb_rx);
        let fresh: Vec<Mbuf> = pkts.split_off(first);
        for pkt in fresh {
            if accept_lacp(view, &pkt, collecting, dedicated_queues) {
                pkts.push(pkt);
                nb_rx += 1;
            } else if slow::is_slow_ether_type(&pkt) {
                member.lacp.handle_slow_frame(pkt, member.mac_addr());
            } else {
                trace!("rx_burst_lacp(): dropping frame (port_id={})", member.port_id);
            }
        }
        idx = (idx + 1) % count;
    }
    cursor.store((start + 1) % count, Ordering::Relaxed);
    nb_rx
}

fn accept_lacp(view: &BondView, pkt: &Mbuf, collecting: bool, dedicated_queues: bool) -> bool {
    if !dedicated_queues && slow::is_lacp_frame(pkt, pkt.vlan_tci()) {
        return false;
    }
    if !collecting {
        return false;
    }
    if view.promiscuous {
        return true;
    }
    let dst: MacAddress = match ethernet2::dst_addr(pkt) {
        Some(dst) => dst,
        None => return false,
    };
    view.is_bond_mac(dst) || (!dst.is_unicast() && view.allmulticast)
}

/// Receives like [rx_burst_round_robin] and learns from the ARP replies among the received frames.
pub(crate) fn rx_burst_alb(
    inner: &BondInner,
    view: &BondView,
    queue: u16,
    cursor: &AtomicUsize,
    pkts: &mut Vec<Mbuf>,
    nb_pkts: usize,
) -> usize {
    let first: usize = pkts.len();
    let nb_rx: usize = rx_burst_round_robin(view, queue, cursor, pkts, nb_pkts);
    for pkt in pkts[first..].iter_mut() {
        if alb::is_arp(pkt) {
            inner.alb.arp_recv(pkt, view);
        }
    }
    nb_rx
}
