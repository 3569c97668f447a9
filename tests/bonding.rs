// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::bondport::{
    bonding::{
        ActorState,
        LacpPort,
    },
    ensure_eq,
    ensure_neq,
    protocols::{
        arp::ArpHeader,
        ethernet2,
        slow::{
            SLOW_PROTOCOLS_MULTICAST,
            SLOW_SUBTYPE_LACP,
        },
        ArpOperation,
        FrameBuilder,
        ETHERNET2_HEADER_SIZE,
    },
    runtime::network::SoftPort,
    BondDevice,
    BondRxQueue,
    BondTxQueue,
    BondingMode,
    Config,
    LinkStatus,
    MacAddress,
    Mbuf,
    PhysicalPort,
    SharedPort,
    XmitPolicy,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    collections::HashSet,
    fs,
    sync::Arc,
    time::Duration,
};
use common::{
    arp_reply,
    bond_with_members,
    member_mac,
    soft_port,
    started_bond,
    udp_frame,
    wait_until,
    ALICE_IPV4,
    ALICE_MAC,
    BOB_IPV4,
    BOB_MAC,
    BOND_PORT_ID,
    CAROL_IPV4,
    CAROL_MAC,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn udp_burst(count: usize) -> Vec<Mbuf> {
    (0..count)
        .map(|i| udp_frame(ALICE_MAC, BOB_MAC, 1024 + i as u16, 80))
        .collect()
}

fn lacp_port(bond: &BondDevice, port_id: u16) -> Result<Arc<LacpPort>> {
    match bond.lacp_port(port_id) {
        Some(lacp) => Ok(lacp),
        None => anyhow::bail!("port {} has no 802.3ad state", port_id),
    }
}

fn lacpdu(src: MacAddress) -> Mbuf {
    FrameBuilder::new(MacAddress::new(SLOW_PROTOCOLS_MULTICAST), src)
        .slow(SLOW_SUBTYPE_LACP)
        .build()
}

fn arp_pdu(frame: &[u8]) -> Result<ArpHeader> {
    Ok(ArpHeader::parse(&frame[ETHERNET2_HEADER_SIZE..])?)
}

//======================================================================================================================
// Classification
//======================================================================================================================

/// The same flow always lands on the same member, and distinct flows spread over several members.
#[test]
fn classifiers_are_deterministic() -> Result<()> {
    let policies: [XmitPolicy; 3] = [XmitPolicy::Layer2, XmitPolicy::Layer23, XmitPolicy::Layer34];
    for policy in policies {
        for src_port in 0..64u16 {
            let frame: Mbuf = udp_frame(ALICE_MAC, BOB_MAC, src_port, 80);
            let index: usize = policy.member_index(&frame, 4);
            ensure_eq!(index < 4, true);
            ensure_eq!(policy.member_index(&frame, 4), index);
        }
    }

    let mut used: HashSet<usize> = HashSet::new();
    for src_port in 0..64u16 {
        used.insert(XmitPolicy::Layer34.member_index(&udp_frame(ALICE_MAC, BOB_MAC, src_port, 80), 4));
    }
    ensure_eq!(used.len() > 1, true);

    // Layer 2 only looks at addresses.
    let a: Mbuf = udp_frame(ALICE_MAC, BOB_MAC, 1, 80);
    let b: Mbuf = udp_frame(ALICE_MAC, BOB_MAC, 2, 443);
    ensure_eq!(XmitPolicy::Layer2.member_index(&a, 4), XmitPolicy::Layer2.member_index(&b, 4));
    Ok(())
}

//======================================================================================================================
// Transmit and Receive
//======================================================================================================================

/// Without active members nothing is sent or received and no member is touched, whatever the mode.
#[test]
fn zero_active_members_in_every_mode() -> Result<()> {
    for mode in BondingMode::ALL {
        let (bond, ports) = bond_with_members(mode, 2)?;
        for port in ports.iter() {
            port.set_link_down();
        }
        bond.start()?;
        ensure_eq!(bond.active_members().is_empty(), true);
        ensure_eq!(bond.link().up, false);

        let txq: BondTxQueue = bond.tx_queue(0)?;
        let rxq: BondRxQueue = bond.rx_queue(0)?;
        let mut pkts: Vec<Mbuf> = udp_burst(4);
        ensure_eq!(txq.tx_burst(&mut pkts), 0);
        ensure_eq!(pkts.len(), 4);
        let mut received: Vec<Mbuf> = Vec::new();
        ensure_eq!(rxq.rx_burst(&mut received, 32), 0);
        for port in ports.iter() {
            ensure_eq!(port.tx_calls(), 0);
            ensure_eq!(port.rx_calls(), 0);
        }
        bond.close()?;
    }
    Ok(())
}

/// Round-robin transmit continues where the previous burst stopped.
#[test]
fn round_robin_tx_rotation() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::RoundRobin, 3)?;
    let txq: BondTxQueue = bond.tx_queue(0)?;
    let mut pkts: Vec<Mbuf> = udp_burst(4);
    ensure_eq!(txq.tx_burst(&mut pkts), 4);
    ensure_eq!(pkts.is_empty(), true);
    ensure_eq!(ports[0].tx_len(), 2);
    ensure_eq!(ports[1].tx_len(), 1);
    ensure_eq!(ports[2].tx_len(), 1);

    let mut pkts: Vec<Mbuf> = udp_burst(1);
    ensure_eq!(txq.tx_burst(&mut pkts), 1);
    ensure_eq!(ports[1].tx_len(), 2);

    // An empty burst leaves the cursor alone.
    let mut pkts: Vec<Mbuf> = Vec::new();
    ensure_eq!(txq.tx_burst(&mut pkts), 0);
    let mut pkts: Vec<Mbuf> = udp_burst(1);
    ensure_eq!(txq.tx_burst(&mut pkts), 1);
    ensure_eq!(ports[2].tx_len(), 2);
    Ok(())
}

/// Round-robin receive starts each burst from the next member.
#[test]
fn round_robin_rx_rotation() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::RoundRobin, 3)?;
    for port in ports.iter() {
        port.push_rx(udp_frame(BOB_MAC, ALICE_MAC, 80, 1024));
        port.push_rx(udp_frame(BOB_MAC, ALICE_MAC, 80, 1025));
    }
    let rxq: BondRxQueue = bond.rx_queue(0)?;
    let mut sources: Vec<u16> = Vec::new();
    for _ in 0..3 {
        let mut pkts: Vec<Mbuf> = Vec::new();
        ensure_eq!(rxq.rx_burst(&mut pkts, 1), 1);
        sources.push(pkts[0].port());
    }
    ensure_eq!(sources, vec![0, 1, 2]);

    let mut pkts: Vec<Mbuf> = Vec::new();
    ensure_eq!(rxq.rx_burst(&mut pkts, 32), 3);
    Ok(())
}

/// A member that runs out of room keeps its share of the burst; the other members are unaffected.
#[test]
fn balance_partial_failure() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::Balance, 4)?;
    ensure_eq!(bond.active_members(), vec![0, 1, 2, 3]);

    // Four frames for member 2 and four for the others.
    let mut for_member_2: Vec<Mbuf> = Vec::new();
    let mut for_others: Vec<Mbuf> = Vec::new();
    for last in 1..=255u8 {
        if for_member_2.len() == 4 && for_others.len() == 4 {
            break;
        }
        let frame: Mbuf = udp_frame(ALICE_MAC, MacAddress::new([0x02, 0, 0, 0, 0x0b, last]), 1024, 80);
        match XmitPolicy::Layer2.member_index(&frame, 4) {
            2 if for_member_2.len() < 4 => for_member_2.push(frame),
            2 => (),
            _ if for_others.len() < 4 => for_others.push(frame),
            _ => (),
        }
    }
    ensure_eq!(for_member_2.len(), 4);
    ensure_eq!(for_others.len(), 4);

    ports[2].set_tx_limit(Some(3));
    let mut pkts: Vec<Mbuf> = for_member_2.into_iter().chain(for_others).collect();
    ensure_eq!(txq_send(&bond, &mut pkts)?, 7);
    ensure_eq!(pkts.len(), 1);
    ensure_eq!(XmitPolicy::Layer2.member_index(&pkts[0], 4), 2);
    ensure_eq!(ports[2].tx_len(), 3);
    Ok(())
}

fn txq_send(bond: &BondDevice, pkts: &mut Vec<Mbuf>) -> Result<usize> {
    Ok(bond.tx_queue(0)?.tx_burst(pkts))
}

/// Every member gets every packet, and the caller ends up with the references it started with.
#[test]
fn broadcast_keeps_reference_counts() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::Broadcast, 3)?;
    let txq: BondTxQueue = bond.tx_queue(0)?;

    let probe: Mbuf = udp_frame(ALICE_MAC, BOB_MAC, 1024, 80);
    let mut pkts: Vec<Mbuf> = vec![probe.clone()];
    ensure_eq!(txq.tx_burst(&mut pkts), 1);
    ensure_eq!(pkts.is_empty(), true);
    ensure_eq!(probe.refcnt(), 4);
    for port in ports.iter() {
        ensure_eq!(port.take_tx().len(), 1);
    }
    ensure_eq!(probe.refcnt(), 1);

    // The most successful member decides what the caller gets back.
    ports[1].set_tx_limit(Some(0));
    let mut pkts: Vec<Mbuf> = vec![probe.clone(), probe.clone()];
    ensure_eq!(txq.tx_burst(&mut pkts), 2);
    ensure_eq!(pkts.is_empty(), true);
    for port in ports.iter() {
        port.take_tx();
    }
    ensure_eq!(probe.refcnt(), 1);

    // Nobody sent anything: the caller keeps the whole burst.
    for port in ports.iter() {
        port.set_tx_limit(Some(0));
    }
    let mut pkts: Vec<Mbuf> = vec![probe.clone(), probe.clone()];
    ensure_eq!(txq.tx_burst(&mut pkts), 0);
    ensure_eq!(pkts.len(), 2);
    ensure_eq!(probe.refcnt(), 3);
    drop(pkts);
    ensure_eq!(probe.refcnt(), 1);
    Ok(())
}

//======================================================================================================================
// Failover
//======================================================================================================================

/// The primary moves to the next active member and stays there when the old primary comes back.
#[test]
fn active_backup_failover_without_reclaim() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::ActiveBackup, 3)?;
    let bond_mac: MacAddress = bond.mac_addr();
    ensure_eq!(bond_mac, member_mac(0));
    ensure_eq!(bond.primary(), Some(0));

    ports[0].set_link_down();
    ensure_eq!(bond.primary(), Some(1));
    ensure_eq!(bond.active_members(), vec![1, 2]);
    ensure_eq!(ports[1].mac_addr(), bond_mac);
    ensure_eq!(ports[0].mac_addr(), member_mac(0));

    let txq: BondTxQueue = bond.tx_queue(0)?;
    let mut pkts: Vec<Mbuf> = udp_burst(3);
    ensure_eq!(txq.tx_burst(&mut pkts), 3);
    ensure_eq!(ports[1].tx_len(), 3);

    ports[0].set_link_up(10_000);
    ensure_eq!(bond.active_members(), vec![1, 2, 0]);
    ensure_eq!(bond.primary(), Some(1));
    Ok(())
}

/// A primary picked by the user is taken back as soon as its link returns.
#[test]
fn user_defined_primary_is_reclaimed() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::ActiveBackup, 3)?;
    bond.set_primary(2)?;
    ensure_eq!(bond.primary(), Some(2));
    ensure_eq!(ports[2].mac_addr(), bond.mac_addr());

    ports[2].set_link_down();
    ensure_eq!(bond.primary(), Some(0));
    ports[2].set_link_up(10_000);
    ensure_eq!(bond.primary(), Some(2));
    ensure_eq!(bond.configured_primary(), Some(2));
    Ok(())
}

/// A member whose link cannot be read is left out of the broadcast speed; the others still count.
#[test]
fn broadcast_speed_skips_unreadable_members() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::Broadcast, 3)?;
    ports[1].set_link_up(1_000);
    ensure_eq!(bond.link().speed_mbps, 1_000);

    ports[0].set_link_query_failure(true);
    ports[2].set_link_up(5_000);
    ensure_eq!(bond.active_members(), vec![0, 1, 2]);
    ensure_eq!(bond.link().up, true);
    ensure_eq!(bond.link().speed_mbps, 1_000);

    // Port 2 now reads as down and leaves; no remaining member can be read.
    ports[1].set_link_query_failure(true);
    ports[2].set_link_query_failure(true);
    ports[2].set_link_up(6_000);
    ensure_eq!(bond.active_members(), vec![0, 1]);
    ensure_eq!(bond.link().speed_mbps, 0);
    Ok(())
}

/// Receive filters follow the primary in active-backup mode and reach every member in balance mode.
#[test]
fn promiscuous_mode_follows_the_mode() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::ActiveBackup, 2)?;
    bond.promiscuous_enable()?;
    ensure_eq!(bond.promiscuous_get(), true);
    ensure_eq!(ports[0].promiscuous_get(), true);
    ensure_eq!(ports[1].promiscuous_get(), false);
    ports[0].set_link_down();
    ensure_eq!(ports[1].promiscuous_get(), true);

    let (bond, ports) = started_bond(BondingMode::Balance, 2)?;
    ports[0].set_promiscuous_failure(true);
    bond.promiscuous_enable()?;
    ensure_eq!(ports[1].promiscuous_get(), true);
    ports[1].set_promiscuous_failure(true);
    ensure_eq!(bond.promiscuous_disable().is_err(), true);
    Ok(())
}

/// A member without link-status-change interrupts is polled.
#[test]
fn polling_monitor_detects_link_changes() -> Result<()> {
    let bond: BondDevice = BondDevice::new("net_bonding_poll", BOND_PORT_ID, BondingMode::ActiveBackup);
    let polled: Arc<SoftPort> = soft_port(0);
    polled.set_lsc_interrupt(false);
    let interrupting: Arc<SoftPort> = soft_port(1);
    bond.add_member(polled.clone())?;
    bond.add_member(interrupting.clone())?;
    bond.set_link_monitoring_interval(Duration::from_millis(5))?;
    bond.start()?;
    ensure_eq!(bond.member_records()?[0].link_status_poll_enabled(), true);
    ensure_eq!(bond.active_members(), vec![0, 1]);

    polled.set_link_down();
    ensure_eq!(wait_until(Duration::from_secs(2), || bond.active_members() == vec![1]), true);
    ensure_eq!(bond.primary(), Some(1));

    polled.set_link_up(10_000);
    ensure_eq!(wait_until(Duration::from_secs(2), || bond.active_members() == vec![1, 0]), true);
    bond.stop()?;
    Ok(())
}

/// Bond link events honor the configured delays.
#[test]
fn delayed_link_propagation() -> Result<()> {
    let (bond, ports) = bond_with_members(BondingMode::RoundRobin, 1)?;
    bond.set_link_down_delay(Duration::from_millis(200))?;
    let (tx, rx): (Sender<LinkStatus>, Receiver<LinkStatus>) = crossbeam_channel::unbounded();
    bond.on_link_event(move |port_id: u16, status: LinkStatus| {
        if port_id == BOND_PORT_ID {
            let _ = tx.send(status);
        }
    });

    bond.start()?;
    let up: LinkStatus = rx.recv_timeout(Duration::from_secs(1))?;
    ensure_eq!(up.up, true);

    ports[0].set_link_down();
    ensure_eq!(bond.link().up, false);
    ensure_eq!(rx.try_recv().is_err(), true);
    let down: LinkStatus = rx.recv_timeout(Duration::from_secs(2))?;
    ensure_eq!(down.up, false);
    Ok(())
}

//======================================================================================================================
// Load Balancing
//======================================================================================================================

/// Members with the same headroom are used in activation order; frames from the bond address leave with the address
/// of the member that carries them.
#[test]
fn tlb_fills_members_in_rank_order() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::Tlb, 3)?;
    let bond_mac: MacAddress = bond.mac_addr();
    ports[0].set_tx_limit(Some(2));
    let txq: BondTxQueue = bond.tx_queue(0)?;
    let mut pkts: Vec<Mbuf> = (0..4).map(|i| udp_frame(bond_mac, BOB_MAC, 1024 + i, 80)).collect();
    ensure_eq!(txq.tx_burst(&mut pkts), 4);
    ensure_eq!(ports[0].tx_len(), 2);
    ensure_eq!(ports[2].tx_len(), 0);
    let spilled: Vec<Mbuf> = ports[1].take_tx();
    ensure_eq!(spilled.len(), 2);
    for pkt in spilled.iter() {
        ensure_eq!(ethernet2::src_addr(pkt), Some(member_mac(1)));
    }
    Ok(())
}

/// ARP replies spread clients over members, and a failed member's clients are moved and refreshed.
#[test]
fn alb_assigns_and_refreshes_clients() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::Alb, 2)?;
    let bond_mac: MacAddress = bond.mac_addr();
    let txq: BondTxQueue = bond.tx_queue(0)?;
    let mut pkts: Vec<Mbuf> = vec![
        arp_reply(bond_mac, ALICE_IPV4, BOB_MAC, BOB_IPV4),
        arp_reply(bond_mac, ALICE_IPV4, CAROL_MAC, CAROL_IPV4),
    ];
    ensure_eq!(txq.tx_burst(&mut pkts), 2);

    let to_bob: Vec<Mbuf> = ports[0].take_tx();
    ensure_eq!(to_bob.len(), 1);
    ensure_eq!(arp_pdu(&to_bob[0])?.get_destination_protocol_addr(), BOB_IPV4);
    let to_carol: Vec<Mbuf> = ports[1].take_tx();
    ensure_eq!(to_carol.len(), 1);
    let pdu: ArpHeader = arp_pdu(&to_carol[0])?;
    ensure_eq!(pdu.get_destination_protocol_addr(), CAROL_IPV4);
    ensure_eq!(pdu.get_sender_hardware_addr(), member_mac(1));
    ensure_eq!(ethernet2::src_addr(&to_carol[0]), Some(member_mac(1)));

    // Carol is moved to the remaining member and told so.
    ports[1].set_link_down();
    let mut pkts: Vec<Mbuf> = Vec::new();
    txq.tx_burst(&mut pkts);
    let updates: Vec<Mbuf> = ports[0].take_tx();
    ensure_eq!(updates.len(), 2);
    for update in updates.iter() {
        let pdu: ArpHeader = arp_pdu(update)?;
        ensure_eq!(pdu.get_operation(), ArpOperation::Reply);
        ensure_eq!(pdu.get_sender_hardware_addr(), member_mac(0));
    }
    Ok(())
}

//======================================================================================================================
// 802.3ad
//======================================================================================================================

/// The aggregation delivers frames for the bond only, hands LACPDUs to the member and sends queued control frames.
#[test]
fn lacp_filters_rx_and_drains_control_frames() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::Lacp, 2)?;
    let bond_mac: MacAddress = bond.mac_addr();
    for port_id in 0..2 {
        lacp_port(&bond, port_id)?.insert_actor_state(ActorState::COLLECTING | ActorState::DISTRIBUTING);
    }

    ports[0].push_rx(lacpdu(BOB_MAC));
    ports[0].push_rx(udp_frame(BOB_MAC, bond_mac, 80, 1024));
    ports[0].push_rx(udp_frame(BOB_MAC, CAROL_MAC, 80, 1024));
    let rxq: BondRxQueue = bond.rx_queue(0)?;
    let mut pkts: Vec<Mbuf> = Vec::new();
    ensure_eq!(rxq.rx_burst(&mut pkts, 32), 1);
    ensure_eq!(ethernet2::dst_addr(&pkts[0]), Some(bond_mac));
    ensure_eq!(lacp_port(&bond, 0)?.pending_slow_rx(), 1);

    let lacp: Arc<LacpPort> = lacp_port(&bond, 1)?;
    lacp.enqueue_ctrl_tx(lacpdu(member_mac(1)))?;
    let txq: BondTxQueue = bond.tx_queue(0)?;
    let mut pkts: Vec<Mbuf> = Vec::new();
    ensure_eq!(txq.tx_burst(&mut pkts), 0);
    ensure_eq!(lacp.pending_ctrl_tx(), 0);
    ensure_eq!(ports[1].take_tx().len(), 1);

    // Members that do not distribute carry no traffic.
    lacp.remove_actor_state(ActorState::DISTRIBUTING);
    let mut pkts: Vec<Mbuf> = udp_burst(8);
    ensure_eq!(txq.tx_burst(&mut pkts), 8);
    ensure_eq!(ports[1].tx_len(), 0);
    ensure_eq!(ports[0].tx_len(), 8);
    Ok(())
}

/// With dedicated queues, control frames are exchanged through the slow queues only.
#[test]
fn lacp_dedicated_queues() -> Result<()> {
    let (bond, ports) = bond_with_members(BondingMode::Lacp, 2)?;
    bond.enable_dedicated_queues(true)?;
    bond.start()?;
    ensure_eq!(ports[0].queues(), (2, 2));

    let lacp: Arc<LacpPort> = lacp_port(&bond, 0)?;
    lacp.enqueue_ctrl_tx(lacpdu(member_mac(0)))?;
    let mut pkts: Vec<Mbuf> = Vec::new();
    ensure_eq!(bond.tx_queue(0)?.tx_burst(&mut pkts), 0);
    ensure_eq!(lacp.pending_ctrl_tx(), 1);
    ensure_eq!(bond.flush_lacp_ctrl(0)?, 1);
    ensure_eq!(ports[0].take_tx().len(), 1);

    ports[0].push_rx(lacpdu(BOB_MAC));
    ensure_eq!(bond.poll_lacp_slow_rx(0)?, 1);
    ensure_eq!(lacp.pending_slow_rx(), 1);
    ensure_eq!(bond.poll_lacp_slow_rx(7).map_err(|e| e.errno), Err(libc::ENODEV));
    Ok(())
}

/// A member whose speed differs from the aggregation is not activated.
#[test]
fn lacp_rejects_mismatched_members() -> Result<()> {
    let bond: BondDevice = BondDevice::new("net_bonding_lacp", BOND_PORT_ID, BondingMode::Lacp);
    let fast: Arc<SoftPort> = SoftPort::new(0, member_mac(0), 10_000);
    let slow: Arc<SoftPort> = SoftPort::new(1, member_mac(1), 1_000);
    bond.add_member(fast)?;
    bond.add_member(slow)?;
    bond.start()?;
    ensure_eq!(bond.active_members(), vec![0]);
    ensure_eq!(bond.link().speed_mbps, 10_000);
    Ok(())
}

//======================================================================================================================
// Membership and Addresses
//======================================================================================================================

#[test]
fn membership_errors() -> Result<()> {
    let (bond, _ports) = bond_with_members(BondingMode::RoundRobin, 1)?;
    let itself: SharedPort = SoftPort::new(BOND_PORT_ID, member_mac(99), 10_000);
    ensure_eq!(bond.add_member(itself).map_err(|e| e.errno), Err(libc::EINVAL));
    ensure_eq!(bond.add_member(soft_port(0)).map_err(|e| e.errno), Err(libc::EEXIST));
    ensure_eq!(bond.remove_member(42).map_err(|e| e.errno), Err(libc::ENODEV));

    for port_id in 1..32u16 {
        bond.add_member(soft_port(port_id))?;
    }
    ensure_eq!(bond.members().len(), 32);
    ensure_eq!(bond.add_member(soft_port(32)).map_err(|e| e.errno), Err(libc::ENOSPC));

    let (jumbo, _ports) = bond_with_members(BondingMode::RoundRobin, 0)?;
    jumbo.set_mtu(9_700)?;
    ensure_eq!(jumbo.add_member(soft_port(0)).map_err(|e| e.errno), Err(libc::EINVAL));
    Ok(())
}

/// Removed members get their own address back; the bond keeps its address while members remain.
#[test]
fn remove_member_restores_its_address() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::Balance, 3)?;
    ensure_eq!(ports[2].mac_addr(), member_mac(0));
    bond.remove_member(2)?;
    ensure_eq!(ports[2].mac_addr(), member_mac(2));
    ensure_eq!(bond.members(), vec![0, 1]);

    bond.remove_member(0)?;
    ensure_eq!(bond.primary(), Some(1));
    ensure_eq!(bond.configured_primary(), Some(1));
    ensure_eq!(bond.active_members(), vec![1]);
    Ok(())
}

/// Secondary addresses reach current and future members and leave them on removal.
#[test]
fn secondary_addresses_follow_membership() -> Result<()> {
    let (bond, ports) = bond_with_members(BondingMode::RoundRobin, 2)?;
    let extra: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0xee, 0x01]);
    bond.mac_addr_add(extra)?;
    ensure_eq!(ports[0].secondary_macs(), vec![extra]);
    ensure_eq!(ports[1].secondary_macs(), vec![extra]);

    let late: Arc<SoftPort> = soft_port(2);
    bond.add_member(late.clone())?;
    ensure_eq!(late.secondary_macs(), vec![extra]);
    bond.remove_member(2)?;
    ensure_eq!(late.secondary_macs().is_empty(), true);

    bond.mac_addr_remove(extra)?;
    ensure_eq!(ports[0].secondary_macs().is_empty(), true);
    ensure_eq!(bond.mac_addrs(), vec![member_mac(0)]);
    Ok(())
}

/// When one member has no room for a secondary address, the members that took it give it back.
#[test]
fn failed_secondary_address_is_rolled_back() -> Result<()> {
    let (bond, ports) = bond_with_members(BondingMode::RoundRobin, 3)?;
    ports[2].set_max_mac_addrs(1);
    let extra: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0xee, 0x02]);
    ensure_eq!(bond.mac_addr_add(extra).map_err(|e| e.errno), Err(libc::ENOSPC));
    for port in ports.iter() {
        ensure_eq!(port.secondary_macs().is_empty(), true);
    }
    ensure_eq!(bond.mac_addrs(), vec![member_mac(0)]);
    Ok(())
}

/// A user-defined address sticks; resetting it goes back to the primary's own address.
#[test]
fn user_defined_mac_address() -> Result<()> {
    let (bond, ports) = started_bond(BondingMode::RoundRobin, 2)?;
    let custom: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0xcc, 0x01]);
    bond.set_mac_addr(custom)?;
    ensure_eq!(ports[1].mac_addr(), custom);
    ensure_eq!(bond.set_mac_addr(MacAddress::broadcast()).map_err(|e| e.errno), Err(libc::EINVAL));
    bond.reset_mac_addr()?;
    ensure_eq!(bond.mac_addr(), member_mac(0));
    ensure_neq!(ports[1].mac_addr(), custom);
    Ok(())
}

//======================================================================================================================
// Configuration
//======================================================================================================================

#[test]
fn bond_from_configuration_file() -> Result<()> {
    let path = ::std::env::temp_dir().join(format!("bondport-test-{}.yaml", ::std::process::id()));
    fs::write(
        &path,
        "bonding:\n  mode: ACTIVE_BACKUP\n  primary: 1\n  members: [0, 1]\n  up_delay_ms: 0\n",
    )?;
    let config: Config = Config::new(&path.to_string_lossy())?;
    let _ = fs::remove_file(&path);

    let ports: Vec<SharedPort> = (0..2).map(|id| soft_port(id) as SharedPort).collect();
    let bond: BondDevice = BondDevice::from_config("net_bonding_cfg", BOND_PORT_ID, &config, &ports)?;
    bond.start()?;
    ensure_eq!(bond.mode(), BondingMode::ActiveBackup);
    ensure_eq!(bond.primary(), Some(1));
    ensure_eq!(ports[1].mac_addr(), bond.mac_addr());
    Ok(())
}
