// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Transmit burst functions. Each one takes the packets to send from `pkts` and leaves the packets it could not send
//! in it, so the caller can retry or free them. The return value is the number of packets sent.

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
    protocols::ethernet2,
    runtime::{
        memory::Mbuf,
        network::{
            prepare_and_transmit,
            types::MacAddress,
        },
    },
};
use ::std::{
    mem,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Sends every bucket on the member at the same position. Packets a member did not send are returned in `pkts`;
/// leftovers of later members come before those of earlier ones.
fn transmit_buckets(members: &[MemberHandle], queue: u16, buckets: Vec<Vec<Mbuf>>, pkts: &mut Vec<Mbuf>) -> usize {
    let mut nb_tx: usize = 0;
    let mut leftovers: Vec<Vec<Mbuf>> = Vec::new();
    for (member, mut bucket) in members.iter().zip(buckets) {
        if bucket.is_empty() {
            continue;
        }
        nb_tx += prepare_and_transmit(member.port.as_ref(), queue, &mut bucket);
        if !bucket.is_empty() {
            leftovers.push(bucket);
        }
    }
    for bucket in leftovers.into_iter().rev() {
        pkts.extend(bucket);
    }
    nb_tx
}

/// Spreads packets over the active members in turn, continuing from where the previous burst on this queue stopped.
pub(crate) fn tx_burst_round_robin(view: &BondView, queue: u16, cursor: &AtomicUsize, pkts: &mut Vec<Mbuf>) -> usize {
    let count: usize = view.active.len();
    if count == 0 || pkts.is_empty() {
        return 0;
    }
    let start: usize = cursor.load(Ordering::Relaxed) % count;
    let mut buckets: Vec<Vec<Mbuf>> = vec![Vec::new(); count];
    let mut last: usize = start;
    for (i, pkt) in pkts.drain(..).enumerate() {
        last = (start + i) % count;
        buckets[last].push(pkt);
    }
    cursor.store((last + 1) % count, Ordering::Relaxed);
    transmit_buckets(&view.active, queue, buckets, pkts)
}

/// Sends everything on the current primary.
pub(crate) fn tx_burst_active_backup(view: &BondView, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
    if view.active.is_empty() {
        return 0;
    }
    match view.primary {
        Some(ref primary) => prepare_and_transmit(primary.port.as_ref(), queue, pkts),
        None => 0,
    }
}

/// Spreads packets over `members` by the hash of their headers.
fn tx_burst_hashed(view: &BondView, members: &[MemberHandle], queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
    if members.is_empty() || pkts.is_empty() {
        return 0;
    }
    let mut indices: Vec<usize> = Vec::with_capacity(pkts.len());
    view.policy.classify(pkts, members.len(), &mut indices);
    let mut buckets: Vec<Vec<Mbuf>> = vec![Vec::new(); members.len()];
    for (pkt, index) in pkts.drain(..).zip(indices) {
        buckets[index].push(pkt);
    }
    transmit_buckets(members, queue, buckets, pkts)
}

pub(crate) fn tx_burst_balance(view: &BondView, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
    tx_burst_hashed(view, &view.active, queue, pkts)
}

/// Sends every packet on every active member. The first member prepares the burst for all. On partial failure the
/// caller gets back what the most successful member did not send; the other copies are released.
pub(crate) fn tx_burst_broadcast(view: &BondView, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
    let count: usize = view.active.len();
    if count == 0 {
        return 0;
    }
    let nb_prep: usize = view.active[0].port.tx_prepare(queue, pkts).min(pkts.len());
    let mut unprepared: Vec<Mbuf> = pkts.split_off(nb_prep);

    let mut best: Option<(usize, Vec<Mbuf>)> = None;
    for (i, member) in view.active.iter().enumerate() {
        // The last member sends the original handles.
        let mut copy: Vec<Mbuf> = if i + 1 == count {
            mem::take(pkts)
        } else {
            pkts.clone()
        };
        let nb_tx: usize = member.port.tx_burst(queue, &mut copy);
        if nb_tx < nb_prep {
            debug!("tx_burst_broadcast(): port {} sent {}/{}", member.port_id, nb_tx, nb_prep);
        }
        match best {
            Some((best_tx, _)) if best_tx >= nb_tx => (),
            _ => best = Some((nb_tx, copy)),
        }
    }
    let (nb_tx, leftovers): (usize, Vec<Mbuf>) = best.unwrap_or_default();
    *pkts = leftovers;
    pkts.append(&mut unprepared);
    nb_tx
}

/// Sends pending control frames, then spreads packets over the distributing members by hash. Control frames are
/// only sent here when they have no queue of their own.
pub(crate) fn tx_burst_lacp(view: &BondView, queue: u16, pkts: &mut Vec<Mbuf>, dedicated_queues: bool) -> usize {
    if !dedicated_queues {
        for member in view.active.iter() {
            if let Some(ctrl) = member.lacp.dequeue_ctrl_tx() {
                let mut burst: Vec<Mbuf> = vec![ctrl];
                if prepare_and_transmit(member.port.as_ref(), queue, &mut burst) != 1 {
                    if let Some(ctrl) = burst.pop() {
                        member.lacp.requeue_ctrl_tx(ctrl);
                    }
                }
            }
        }
    }
    if pkts.is_empty() {
        return 0;
    }
    let distributing: Vec<MemberHandle> = view
        .active
        .iter()
        .filter(|member| member.lacp.is_distributing())
        .cloned()
        .collect();
    tx_burst_hashed(view, &distributing, queue, pkts)
}

/// Fills the best ranked members first. Frames sent from the MAC address of the configured primary leave with the
/// address of the member that carries them.
pub(crate) fn tx_burst_tlb(inner: &BondInner, view: &BondView, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
    if view.active.is_empty() {
        return 0;
    }
    let primary_mac: Option<MacAddress> = view.configured_primary.as_ref().map(|primary| primary.mac_addr());
    let mut nb_tx: usize = 0;
    for member in inner.tlb.ranked_members(view) {
        if pkts.is_empty() {
            break;
        }
        if let Some(primary_mac) = primary_mac {
            let member_mac: MacAddress = member.mac_addr();
            for pkt in pkts.iter_mut() {
                if ethernet2::src_addr(pkt) == Some(primary_mac) {
                    ethernet2::set_src_addr(pkt, member_mac);
                }
            }
        }
        nb_tx += prepare_and_transmit(member.port.as_ref(), queue, pkts);
    }
    nb_tx
}

/// ARP frames go to the member that serves their peer, refresh replies are sent when an assignment changed, and
/// everything else is sent as in [tx_burst_tlb].
pub(crate) fn tx_burst_alb(inner: &BondInner, view: &BondView, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
    if view.active.is_empty() {
        return 0;
    }
    let mut arp_buckets: Vec<Vec<Mbuf>> = vec![Vec::new(); view.members.len()];
    let mut others: Vec<Mbuf> = Vec::new();
    for mut pkt in pkts.drain(..) {
        if !alb::is_arp(&pkt) {
            others.push(pkt);
            continue;
        }
        match inner.alb.arp_xmit(&mut pkt, view) {
            Some(member) => {
                ethernet2::set_src_addr(&mut pkt, member.mac_addr());
                match view.members.iter().position(|m| m.port_id == member.port_id) {
                    Some(index) => arp_buckets[index].push(pkt),
                    None => others.push(pkt),
                }
            },
            None => others.push(pkt),
        }
    }

    let mut unsent: Vec<Mbuf> = Vec::new();
    let mut nb_tx: usize = transmit_buckets(&view.members, queue, arp_buckets, &mut unsent);

    if inner.alb.take_ntt() {
        for (port_id, update) in inner.alb.build_updates() {
            if let Some(member) = view.member(port_id) {
                let mut burst: Vec<Mbuf> = vec![update];
                // Refresh replies that do not fit are not retried.
                prepare_and_transmit(member.port.as_ref(), queue, &mut burst);
            }
        }
    }

    if !others.is_empty() {
        nb_tx += tx_burst_tlb(inner, view, queue, &mut others);
        unsent.append(&mut others);
    }
    *pkts = unsent;
    nb_tx
}
