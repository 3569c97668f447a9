// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    protocols::{
        arp::{
            ArpHeader,
            ARP_MESSAGE_SIZE,
        },
        ethernet2::{
            EtherType2,
            ETHERNET2_HEADER_SIZE,
        },
        ip::{
            IpProtocol,
            IPV4_HEADER_MIN_SIZE,
            IPV6_HEADER_SIZE,
            TCP_HEADER_MIN_SIZE,
            UDP_HEADER_SIZE,
        },
        slow::SLOW_FRAME_SIZE,
    },
    runtime::{
        memory::Mbuf,
        network::types::MacAddress,
    },
};
use ::std::net::{
    Ipv4Addr,
    Ipv6Addr,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Minimum Ethernet frame size, without the frame check sequence.
const MIN_FRAME_SIZE: usize = 60;

//======================================================================================================================
// Enumerations
//======================================================================================================================

#[derive(Clone, Debug)]
enum Transport {
    None,
    Tcp(u16, u16),
    Udp(u16, u16),
}

#[derive(Clone, Debug)]
enum Network {
    Raw(u16),
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        flags_offset: u16,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
    },
    Arp(ArpHeader),
    Slow(u8),
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Builds Ethernet frames for traffic generators and tests.
#[derive(Clone, Debug)]
pub struct FrameBuilder {
    dst: MacAddress,
    src: MacAddress,
    /// (TPID, TCI) pairs, outermost first.
    vlans: Vec<(u16, u16)>,
    network: Network,
    transport: Transport,
    payload_len: usize,
    truncate: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FrameBuilder {
    pub fn new(dst: MacAddress, src: MacAddress) -> Self {
        Self {
            dst,
            src,
            vlans: Vec::new(),
            network: Network::Raw(0x88b5),
            transport: Transport::None,
            payload_len: 0,
            truncate: None,
        }
    }

    /// Adds an 802.1Q tag.
    pub fn vlan(mut self, vlan_id: u16) -> Self {
        self.vlans.push((EtherType2::Vlan as u16, vlan_id));
        self
    }

    /// Adds an 802.1ad service tag followed by an 802.1Q customer tag.
    pub fn qinq(mut self, outer_vlan_id: u16, inner_vlan_id: u16) -> Self {
        self.vlans.push((EtherType2::QinQ as u16, outer_vlan_id));
        self.vlans.push((EtherType2::Vlan as u16, inner_vlan_id));
        self
    }

    /// Uses a raw EtherType without any network header.
    pub fn ether_type(mut self, ether_type: u16) -> Self {
        self.network = Network::Raw(ether_type);
        self
    }

    pub fn ipv4(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        self.network = Network::Ipv4 {
            src,
            dst,
            flags_offset: 0,
        };
        self
    }

    /// Marks an IPv4 datagram as a fragment with the given flags and offset field.
    pub fn fragment(mut self, flags_offset: u16) -> Self {
        if let Network::Ipv4 {
            flags_offset: ref mut field,
            ..
        } = self.network
        {
            *field = flags_offset;
        }
        self
    }

    pub fn ipv6(mut self, src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        self.network = Network::Ipv6 { src, dst };
        self
    }

    pub fn tcp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.transport = Transport::Tcp(src_port, dst_port);
        self
    }

    pub fn udp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.transport = Transport::Udp(src_port, dst_port);
        self
    }

    pub fn arp(mut self, pdu: ArpHeader) -> Self {
        self.network = Network::Arp(pdu);
        self
    }

    /// Builds a slow protocol frame with the given subtype.
    pub fn slow(mut self, subtype: u8) -> Self {
        self.network = Network::Slow(subtype);
        self
    }

    pub fn payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }

    /// Cuts the frame to `len` bytes, without padding.
    pub fn truncate(mut self, len: usize) -> Self {
        self.truncate = Some(len);
        self
    }

    /// Renders the frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame: Vec<u8> = Vec::with_capacity(MIN_FRAME_SIZE);
        frame.extend_from_slice(&self.dst.octets());
        frame.extend_from_slice(&self.src.octets());
        for (tpid, tci) in &self.vlans {
            frame.extend_from_slice(&tpid.to_be_bytes());
            frame.extend_from_slice(&tci.to_be_bytes());
        }
        let ether_type: u16 = match self.network {
            Network::Raw(ether_type) => ether_type,
            Network::Ipv4 { .. } => EtherType2::Ipv4 as u16,
            Network::Ipv6 { .. } => EtherType2::Ipv6 as u16,
            Network::Arp(_) => EtherType2::Arp as u16,
            Network::Slow(_) => EtherType2::Slow as u16,
        };
        frame.extend_from_slice(&ether_type.to_be_bytes());

        let l4: Vec<u8> = self.transport_bytes();
        match self.network {
            Network::Raw(_) => (),
            Network::Ipv4 {
                src,
                dst,
                flags_offset,
            } => {
                let total_len: u16 = (IPV4_HEADER_MIN_SIZE + l4.len() + self.payload_len) as u16;
                let mut header: [u8; IPV4_HEADER_MIN_SIZE] = [0; IPV4_HEADER_MIN_SIZE];
                header[0] = 0x45;
                header[2..4].copy_from_slice(&total_len.to_be_bytes());
                header[6..8].copy_from_slice(&flags_offset.to_be_bytes());
                header[8] = 64;
                header[9] = self.protocol_number();
                header[12..16].copy_from_slice(&src.octets());
                header[16..20].copy_from_slice(&dst.octets());
                frame.extend_from_slice(&header);
            },
            Network::Ipv6 { src, dst } => {
                let payload_len: u16 = (l4.len() + self.payload_len) as u16;
                let mut header: [u8; IPV6_HEADER_SIZE] = [0; IPV6_HEADER_SIZE];
                header[0] = 0x60;
                header[4..6].copy_from_slice(&payload_len.to_be_bytes());
                header[6] = self.protocol_number();
                header[7] = 64;
                header[8..24].copy_from_slice(&src.octets());
                header[24..40].copy_from_slice(&dst.octets());
                frame.extend_from_slice(&header);
            },
            Network::Arp(ref pdu) => {
                let mut body: [u8; ARP_MESSAGE_SIZE] = [0; ARP_MESSAGE_SIZE];
                // The buffer is exactly one ARP message long.
                if pdu.serialize(&mut body).is_ok() {
                    frame.extend_from_slice(&body);
                }
            },
            Network::Slow(subtype) => {
                frame.push(subtype);
                frame.resize(SLOW_FRAME_SIZE.max(frame.len()), 0);
            },
        }
        if matches!(self.network, Network::Ipv4 { .. } | Network::Ipv6 { .. }) {
            frame.extend_from_slice(&l4);
        }
        frame.resize(frame.len() + self.payload_len, 0);

        match self.truncate {
            Some(len) => frame.truncate(len),
            None if frame.len() < MIN_FRAME_SIZE => frame.resize(MIN_FRAME_SIZE, 0),
            None => (),
        }
        frame
    }

    /// Renders the frame into a packet buffer.
    pub fn build(&self) -> Mbuf {
        Mbuf::from_slice(&self.to_bytes())
    }

    fn protocol_number(&self) -> u8 {
        match self.transport {
            Transport::Tcp(..) => IpProtocol::Tcp as u8,
            Transport::Udp(..) => IpProtocol::Udp as u8,
            // No next header.
            Transport::None => 59,
        }
    }

    fn transport_bytes(&self) -> Vec<u8> {
        match self.transport {
            Transport::None => Vec::new(),
            Transport::Tcp(src_port, dst_port) => {
                let mut header: Vec<u8> = vec![0; TCP_HEADER_MIN_SIZE];
                header[0..2].copy_from_slice(&src_port.to_be_bytes());
                header[2..4].copy_from_slice(&dst_port.to_be_bytes());
                header[12] = 0x50;
                header
            },
            Transport::Udp(src_port, dst_port) => {
                let mut header: Vec<u8> = vec![0; UDP_HEADER_SIZE];
                header[0..2].copy_from_slice(&src_port.to_be_bytes());
                header[2..4].copy_from_slice(&dst_port.to_be_bytes());
                header[4..6].copy_from_slice(&((UDP_HEADER_SIZE + self.payload_len) as u16).to_be_bytes());
                header
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
