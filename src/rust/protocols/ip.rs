// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Constants
//======================================================================================================================

pub const IPV4_HEADER_MIN_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const TCP_HEADER_MIN_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

/// IPv4 Control Flag: More Fragments.
const IPV4_CTRL_FLAG_MF: u16 = 0x2000;
/// Mask of the IPv4 fragment offset.
const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

//======================================================================================================================
// Enumerations
//======================================================================================================================

#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IpProtocol {
    Tcp = 6,
    Udp = 17,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// View over an IPv4 header.
pub struct Ipv4View<'a>(&'a [u8]);

/// View over an IPv6 header.
pub struct Ipv6View<'a>(&'a [u8]);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<'a> Ipv4View<'a> {
    /// Wraps the IPv4 header at the start of `bytes`. Fails if the fixed header does not fit.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < IPV4_HEADER_MIN_SIZE {
            return None;
        }
        Some(Self(bytes))
    }

    /// Header length in bytes, as announced by the IHL field.
    pub fn header_len(&self) -> usize {
        ((self.0[0] & 0x0f) as usize) * 4
    }

    pub fn protocol(&self) -> u8 {
        self.0[9]
    }

    /// Source address, as stored on the wire.
    pub fn src_raw(&self) -> [u8; 4] {
        [self.0[12], self.0[13], self.0[14], self.0[15]]
    }

    /// Destination address, as stored on the wire.
    pub fn dst_raw(&self) -> [u8; 4] {
        [self.0[16], self.0[17], self.0[18], self.0[19]]
    }

    /// Returns `true` if the datagram is a fragment (more fragments follow, or non-zero offset).
    pub fn is_fragment(&self) -> bool {
        let flags_offset: u16 = u16::from_be_bytes([self.0[6], self.0[7]]);
        (flags_offset & (IPV4_CTRL_FLAG_MF | IPV4_FRAG_OFFSET_MASK)) != 0
    }
}

impl<'a> Ipv6View<'a> {
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < IPV6_HEADER_SIZE {
            return None;
        }
        Some(Self(bytes))
    }

    pub fn next_header(&self) -> u8 {
        self.0[6]
    }

    /// Source address, as stored on the wire.
    pub fn src_raw(&self) -> &'a [u8] {
        &self.0[8..24]
    }

    /// Destination address, as stored on the wire.
    pub fn dst_raw(&self) -> &'a [u8] {
        &self.0[24..40]
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reads the raw source and destination ports of the TCP or UDP header at the start of `bytes`.
pub fn l4_ports_raw(bytes: &[u8]) -> Option<([u8; 2], [u8; 2])> {
    let ports: &[u8] = bytes.get(0..4)?;
    Some(([ports[0], ports[1]], [ports[2], ports[3]]))
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl TryFrom<u8> for IpProtocol {
    type Error = u8;

    fn try_from(n: u8) -> Result<Self, u8> {
        match n {
            6 => Ok(IpProtocol::Tcp),
            17 => Ok(IpProtocol::Udp),
            n => Err(n),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
