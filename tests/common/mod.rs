// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::bondport::{
    protocols::{
        ArpHeader,
        ArpOperation,
        FrameBuilder,
    },
    runtime::network::SoftPort,
    BondDevice,
    BondingMode,
    Fail,
    Mbuf,
    MacAddress,
};
use ::std::{
    net::Ipv4Addr,
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const ALICE_MAC: MacAddress = MacAddress::new([0x12, 0x23, 0x45, 0x67, 0x89, 0xab]);
pub const BOB_MAC: MacAddress = MacAddress::new([0xab, 0x89, 0x67, 0x45, 0x23, 0x12]);
pub const CAROL_MAC: MacAddress = MacAddress::new([0x02, 0x0c, 0x0a, 0x00, 0x00, 0x01]);
pub const ALICE_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const BOB_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
pub const CAROL_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 3);

/// Port identifier of the bonds built by the tests.
pub const BOND_PORT_ID: u16 = 100;

pub const LINK_SPEED_MBPS: u32 = 10_000;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Default MAC address of member `port_id`.
pub fn member_mac(port_id: u16) -> MacAddress {
    MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x01, port_id as u8])
}

pub fn soft_port(port_id: u16) -> Arc<SoftPort> {
    SoftPort::new(port_id, member_mac(port_id), LINK_SPEED_MBPS)
}

/// Builds a stopped bond over `count` members with their link up.
pub fn bond_with_members(mode: BondingMode, count: u16) -> Result<(BondDevice, Vec<Arc<SoftPort>>), Fail> {
    let bond: BondDevice = BondDevice::new("net_bonding_test", BOND_PORT_ID, mode);
    let mut ports: Vec<Arc<SoftPort>> = Vec::with_capacity(count as usize);
    for port_id in 0..count {
        let port: Arc<SoftPort> = soft_port(port_id);
        bond.add_member(port.clone())?;
        ports.push(port);
    }
    Ok((bond, ports))
}

/// Same as [bond_with_members], and starts the bond.
pub fn started_bond(mode: BondingMode, count: u16) -> Result<(BondDevice, Vec<Arc<SoftPort>>), Fail> {
    let (bond, ports) = bond_with_members(mode, count)?;
    bond.start()?;
    Ok((bond, ports))
}

/// UDP datagram from Alice to Bob.
pub fn udp_frame(src: MacAddress, dst: MacAddress, src_port: u16, dst_port: u16) -> Mbuf {
    FrameBuilder::new(dst, src)
        .ipv4(ALICE_IPV4, BOB_IPV4)
        .udp(src_port, dst_port)
        .payload_len(32)
        .build()
}

/// ARP frame carrying `pdu`, sent from `src` to `dst`.
pub fn arp_frame(src: MacAddress, dst: MacAddress, pdu: ArpHeader) -> Mbuf {
    FrameBuilder::new(dst, src).arp(pdu).build()
}

/// ARP reply from `local` to `remote`.
pub fn arp_reply(
    local_mac: MacAddress,
    local_ipv4: Ipv4Addr,
    remote_mac: MacAddress,
    remote_ipv4: Ipv4Addr,
) -> Mbuf {
    let pdu: ArpHeader = ArpHeader::new(ArpOperation::Reply, local_mac, local_ipv4, remote_mac, remote_ipv4);
    arp_frame(local_mac, remote_mac, pdu)
}

/// Polls `condition` until it holds or `timeout` expires.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline: Instant = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
