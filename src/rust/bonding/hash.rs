// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Transmit hash classifiers. Each classifier maps a frame to a member index in `[0, member_count)`. Header fields are
//! folded as raw words in host byte order; fields that cannot be parsed contribute zero.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::mode::XmitPolicy,
    protocols::{
        ethernet2::{
            self,
            EtherType2,
            ETHERNET2_HEADER_SIZE,
        },
        ip::{
            self,
            IpProtocol,
            Ipv4View,
            Ipv6View,
            TCP_HEADER_MIN_SIZE,
            UDP_HEADER_SIZE,
        },
    },
    runtime::memory::Mbuf,
};

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl XmitPolicy {
    /// Computes the member index of `frame` among `member_count` members. Returns zero if there are no members.
    pub fn member_index(&self, frame: &[u8], member_count: usize) -> usize {
        if member_count == 0 {
            return 0;
        }
        let hash: u32 = match self {
            XmitPolicy::Layer2 => {
                let hash: u32 = ether_hash(frame);
                hash ^ (hash >> 8)
            },
            XmitPolicy::Layer23 => fold(ether_hash(frame) ^ l3_hash(frame)),
            XmitPolicy::Layer34 => fold(ether_hash(frame) ^ l3_hash(frame) ^ l4_hash(frame)),
        };
        (hash as usize) % member_count
    }

    /// Classifies a batch. On return `indices[i]` is the member index of `pkts[i]`.
    pub fn classify(&self, pkts: &[Mbuf], member_count: usize, indices: &mut Vec<usize>) {
        indices.clear();
        indices.extend(pkts.iter().map(|pkt| self.member_index(pkt, member_count)));
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn fold(mut hash: u32) -> u32 {
    hash ^= hash >> 16;
    hash ^= hash >> 8;
    hash
}

fn word16(bytes: &[u8], offset: usize) -> u32 {
    u16::from_ne_bytes([bytes[offset], bytes[offset + 1]]) as u32
}

fn word32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

/// XOR of the three 16-bit words of the source and destination MAC addresses.
fn ether_hash(frame: &[u8]) -> u32 {
    if frame.len() < 12 {
        return 0;
    }
    (0..3).fold(0, |hash, i| hash ^ word16(frame, i * 2) ^ word16(frame, 6 + i * 2))
}

/// Locates the network header. Returns its EtherType and the bytes from its first octet on.
fn network_header(frame: &[u8]) -> Option<(u16, &[u8])> {
    let (offset, proto): (usize, u16) = ethernet2::vlan_offset(frame)?;
    let l3: &[u8] = frame.get(ETHERNET2_HEADER_SIZE + offset..)?;
    Some((proto, l3))
}

fn l3_hash(frame: &[u8]) -> u32 {
    match network_header(frame) {
        Some((proto, l3)) if proto == EtherType2::Ipv4 as u16 => match Ipv4View::new(l3) {
            Some(ipv4) => u32::from_ne_bytes(ipv4.src_raw()) ^ u32::from_ne_bytes(ipv4.dst_raw()),
            None => 0,
        },
        Some((proto, l3)) if proto == EtherType2::Ipv6 as u16 => match Ipv6View::new(l3) {
            Some(ipv6) => {
                let (src, dst): (&[u8], &[u8]) = (ipv6.src_raw(), ipv6.dst_raw());
                (0..4).fold(0, |hash, i| hash ^ word32(src, i * 4) ^ word32(dst, i * 4))
            },
            None => 0,
        },
        _ => 0,
    }
}

fn l4_hash(frame: &[u8]) -> u32 {
    let (proto, l3): (u16, &[u8]) = match network_header(frame) {
        Some(header) => header,
        None => return 0,
    };
    let (next_proto, l4): (u8, &[u8]) = if proto == EtherType2::Ipv4 as u16 {
        let ipv4: Ipv4View = match Ipv4View::new(l3) {
            Some(ipv4) => ipv4,
            None => return 0,
        };
        // Fragments carry no complete transport header.
        if ipv4.is_fragment() || ipv4.header_len() < ip::IPV4_HEADER_MIN_SIZE {
            return 0;
        }
        match l3.get(ipv4.header_len()..) {
            Some(l4) => (ipv4.protocol(), l4),
            None => return 0,
        }
    } else if proto == EtherType2::Ipv6 as u16 {
        match Ipv6View::new(l3) {
            Some(ipv6) => (ipv6.next_header(), &l3[ip::IPV6_HEADER_SIZE..]),
            None => return 0,
        }
    } else {
        return 0;
    };

    let header_size: usize = match IpProtocol::try_from(next_proto) {
        Ok(IpProtocol::Tcp) => TCP_HEADER_MIN_SIZE,
        Ok(IpProtocol::Udp) => UDP_HEADER_SIZE,
        Err(_) => return 0,
    };
    if l4.len() < header_size {
        return 0;
    }
    match ip::l4_ports_raw(l4) {
        Some((src_port, dst_port)) => (u16::from_ne_bytes(src_port) ^ u16::from_ne_bytes(dst_port)) as u32,
        None => 0,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
