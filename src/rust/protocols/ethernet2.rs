// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    network::types::MacAddress,
};
use ::libc::{
    EBADMSG,
    ENOTSUP,
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const ETHERNET2_HEADER_SIZE: usize = 14;
pub const VLAN_HEADER_SIZE: usize = 4;

//======================================================================================================================
// Enumerations
//======================================================================================================================

#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EtherType2 {
    Ipv4 = 0x800,
    Arp = 0x806,
    Vlan = 0x8100,
    Ipv6 = 0x86dd,
    Slow = 0x8809,
    QinQ = 0x88a8,
}

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ethernet2Header {
    // Bytes 0..6
    dst_addr: MacAddress,
    // Bytes 6..12
    src_addr: MacAddress,
    // Bytes 12..14
    ether_type: u16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Ethernet2Header {
    /// Creates a header for an Ethernet frame.
    pub fn new(dst_addr: MacAddress, src_addr: MacAddress, ether_type: u16) -> Self {
        Self {
            dst_addr,
            src_addr,
            ether_type,
        }
    }

    /// Parses the Ethernet header at the start of `frame`.
    pub fn parse(frame: &[u8]) -> Result<Self, Fail> {
        if frame.len() < ETHERNET2_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "frame too small"));
        }
        Ok(Self {
            dst_addr: MacAddress::from_bytes(&frame[0..6])?,
            src_addr: MacAddress::from_bytes(&frame[6..12])?,
            ether_type: u16::from_be_bytes([frame[12], frame[13]]),
        })
    }

    /// Writes the target header at the start of `frame`.
    pub fn serialize(&self, frame: &mut [u8]) -> Result<(), Fail> {
        if frame.len() < ETHERNET2_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "frame too small"));
        }
        frame[0..6].copy_from_slice(&self.dst_addr.octets());
        frame[6..12].copy_from_slice(&self.src_addr.octets());
        frame[12..14].copy_from_slice(&self.ether_type.to_be_bytes());
        Ok(())
    }

    pub fn dst_addr(&self) -> MacAddress {
        self.dst_addr
    }

    pub fn src_addr(&self) -> MacAddress {
        self.src_addr
    }

    pub fn ether_type(&self) -> u16 {
        self.ether_type
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reads the destination MAC address of `frame`.
pub fn dst_addr(frame: &[u8]) -> Option<MacAddress> {
    frame.get(0..6).and_then(|bytes| MacAddress::from_bytes(bytes).ok())
}

/// Reads the source MAC address of `frame`.
pub fn src_addr(frame: &[u8]) -> Option<MacAddress> {
    frame.get(6..12).and_then(|bytes| MacAddress::from_bytes(bytes).ok())
}

/// Overwrites the source MAC address of `frame`. Frames shorter than an Ethernet header are left untouched.
pub fn set_src_addr(frame: &mut [u8], mac: MacAddress) {
    if let Some(bytes) = frame.get_mut(6..12) {
        bytes.copy_from_slice(&mac.octets());
    }
}

/// Reads the outer EtherType of `frame`.
pub fn ether_type(frame: &[u8]) -> Option<u16> {
    frame.get(12..14).map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Skips up to two VLAN tags (an 802.1Q or QinQ outer tag followed by an optional 802.1Q inner tag). Returns the
/// number of tag bytes following the Ethernet header and the EtherType found after them.
pub fn vlan_offset(frame: &[u8]) -> Option<(usize, u16)> {
    let mut proto: u16 = ether_type(frame)?;
    let mut offset: usize = 0;
    if proto == EtherType2::Vlan as u16 || proto == EtherType2::QinQ as u16 {
        offset += VLAN_HEADER_SIZE;
        proto = read_be16(frame, ETHERNET2_HEADER_SIZE + offset - 2)?;
        if proto == EtherType2::Vlan as u16 {
            offset += VLAN_HEADER_SIZE;
            proto = read_be16(frame, ETHERNET2_HEADER_SIZE + offset - 2)?;
        }
    }
    Some((offset, proto))
}

/// Reads the VLAN identifiers of the (at most two) tags of `frame`, outermost first.
pub fn vlan_tags(frame: &[u8]) -> Vec<u16> {
    let mut tags: Vec<u16> = Vec::new();
    if let Some((offset, _)) = vlan_offset(frame) {
        let mut position: usize = ETHERNET2_HEADER_SIZE;
        while position < ETHERNET2_HEADER_SIZE + offset {
            match read_be16(frame, position) {
                Some(tci) => tags.push(tci & 0x0fff),
                None => break,
            }
            position += VLAN_HEADER_SIZE;
        }
    }
    tags
}

fn read_be16(frame: &[u8], offset: usize) -> Option<u16> {
    frame
        .get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl TryFrom<u16> for EtherType2 {
    type Error = Fail;

    fn try_from(n: u16) -> Result<Self, Fail> {
        match n {
            0x800 => Ok(EtherType2::Ipv4),
            0x806 => Ok(EtherType2::Arp),
            0x8100 => Ok(EtherType2::Vlan),
            0x86dd => Ok(EtherType2::Ipv6),
            0x8809 => Ok(EtherType2::Slow),
            0x88a8 => Ok(EtherType2::QinQ),
            _ => Err(Fail::new(ENOTSUP, "unsupported ETHERTYPE")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::ensure_eq;
    use ::anyhow::Result;

    fn frame_with_tags(tags: &[u16], inner: u16) -> Vec<u8> {
        let mut frame: Vec<u8> = vec![0; 12];
        for (i, tpid) in tags.iter().enumerate() {
            frame.extend_from_slice(&tpid.to_be_bytes());
            frame.extend_from_slice(&(100 + i as u16).to_be_bytes());
        }
        frame.extend_from_slice(&inner.to_be_bytes());
        frame.extend_from_slice(&[0; 20]);
        frame
    }

    #[test]
    fn untagged_frame_has_no_offset() -> Result<()> {
        let frame: Vec<u8> = frame_with_tags(&[], 0x800);
        ensure_eq!(vlan_offset(&frame), Some((0, 0x800)));
        Ok(())
    }

    #[test]
    fn qinq_frame_skips_both_tags() -> Result<()> {
        let frame: Vec<u8> = frame_with_tags(&[0x88a8, 0x8100], 0x86dd);
        ensure_eq!(vlan_offset(&frame), Some((8, 0x86dd)));
        ensure_eq!(vlan_tags(&frame), vec![100, 101]);
        Ok(())
    }

    #[test]
    fn single_tag_frame_skips_one_tag() -> Result<()> {
        let frame: Vec<u8> = frame_with_tags(&[0x8100], 0x806);
        ensure_eq!(vlan_offset(&frame), Some((4, 0x806)));
        Ok(())
    }

    #[test]
    fn truncated_frame_yields_none() -> Result<()> {
        ensure_eq!(vlan_offset(&[0u8; 10]), None);
        ensure_eq!(vlan_offset(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x81, 0x00, 0]), None);
        Ok(())
    }

    #[test]
    fn header_round_trip() -> Result<()> {
        let header: Ethernet2Header = Ethernet2Header::new(
            MacAddress::broadcast(),
            MacAddress::new([2, 0, 0, 0, 0, 1]),
            EtherType2::Arp as u16,
        );
        let mut frame: [u8; ETHERNET2_HEADER_SIZE] = [0; ETHERNET2_HEADER_SIZE];
        header.serialize(&mut frame)?;
        ensure_eq!(Ethernet2Header::parse(&frame)?, header);
        Ok(())
    }
}
