// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Slow protocols (IEEE 802.3 annex 57A): LACP and Marker frames share EtherType 0x8809 and are told apart by the
//! subtype byte that follows the Ethernet header.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::protocols::ethernet2::{
    self,
    EtherType2,
    ETHERNET2_HEADER_SIZE,
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const SLOW_SUBTYPE_LACP: u8 = 1;
pub const SLOW_SUBTYPE_MARKER: u8 = 2;

/// Size of a LACPDU / Marker PDU frame, Ethernet header included.
pub const SLOW_FRAME_SIZE: usize = 124;

/// Slow protocols multicast group address.
pub const SLOW_PROTOCOLS_MULTICAST: [u8; 6] = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x02];

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the slow protocol subtype of `frame`, if any.
pub fn subtype(frame: &[u8]) -> Option<u8> {
    frame.get(ETHERNET2_HEADER_SIZE).copied()
}

/// Returns `true` if `frame` carries the slow protocols EtherType.
pub fn is_slow_ether_type(frame: &[u8]) -> bool {
    ethernet2::ether_type(frame) == Some(EtherType2::Slow as u16)
}

/// Returns `true` if `frame` is an untagged LACP or Marker frame. Frames that the receiving port reported as VLAN
/// tagged (stripped TCI) are never slow frames.
pub fn is_lacp_frame(frame: &[u8], vlan_tci: Option<u16>) -> bool {
    if vlan_tci.is_some() || !is_slow_ether_type(frame) {
        return false;
    }
    matches!(subtype(frame), Some(SLOW_SUBTYPE_LACP) | Some(SLOW_SUBTYPE_MARKER))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::ensure_eq;
    use ::anyhow::Result;

    fn slow_frame(subtype: u8) -> Vec<u8> {
        let mut frame: Vec<u8> = vec![0; SLOW_FRAME_SIZE];
        frame[0..6].copy_from_slice(&SLOW_PROTOCOLS_MULTICAST);
        frame[12..14].copy_from_slice(&(EtherType2::Slow as u16).to_be_bytes());
        frame[ETHERNET2_HEADER_SIZE] = subtype;
        frame
    }

    #[test]
    fn lacp_and_marker_are_slow_frames() -> Result<()> {
        ensure_eq!(is_lacp_frame(&slow_frame(SLOW_SUBTYPE_LACP), None), true);
        ensure_eq!(is_lacp_frame(&slow_frame(SLOW_SUBTYPE_MARKER), None), true);
        Ok(())
    }

    #[test]
    fn other_subtypes_and_tagged_frames_are_not() -> Result<()> {
        ensure_eq!(is_lacp_frame(&slow_frame(10), None), false);
        ensure_eq!(is_lacp_frame(&slow_frame(SLOW_SUBTYPE_LACP), Some(5)), false);
        ensure_eq!(is_slow_ether_type(&slow_frame(10)), true);
        Ok(())
    }
}
