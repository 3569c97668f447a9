// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// An Mbuf is an opaque, reference-counted packet handle. Cloning an Mbuf takes another reference to the same packet
// (the equivalent of a reference-count update on a DPDK mbuf) and dropping the last reference frees the packet, which
// returns its slot to the owning pool, if any. Writes go through copy-on-write: a packet shared by several handles
// is duplicated before being modified, so the other holders never observe the change.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::memory::pool::PoolSlot;
use ::std::{
    fmt,
    ops::{
        Deref,
        DerefMut,
    },
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Packet data plus the per-packet metadata the bonding layer consumes.
struct MetaData {
    /// Frame bytes, starting at the Ethernet header.
    data: Vec<u8>,
    /// Input port.
    port: u16,
    /// VLAN TCI stripped by the receiving port.
    vlan_tci: Option<u16>,
    /// Pool slot that is released when this data is freed.
    slot: Option<PoolSlot>,
}

/// Reference-counted packet buffer.
#[derive(Clone)]
pub struct Mbuf(Arc<MetaData>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Mbuf {
    /// Creates a zero-filled packet buffer of `len` bytes that does not belong to any pool.
    pub fn new(len: usize) -> Self {
        Self::with_slot(vec![0; len], None)
    }

    /// Creates a packet buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::with_slot(bytes.to_vec(), None)
    }

    pub(super) fn with_slot(data: Vec<u8>, slot: Option<PoolSlot>) -> Self {
        Self(Arc::new(MetaData {
            data,
            port: 0,
            vlan_tci: None,
            slot,
        }))
    }

    /// Returns the number of live references to the underlying packet.
    pub fn refcnt(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Returns `true` if both handles refer to the same packet.
    pub fn ptr_eq(&self, other: &Mbuf) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn port(&self) -> u16 {
        self.0.port
    }

    pub fn set_port(&mut self, port: u16) {
        Arc::make_mut(&mut self.0).port = port;
    }

    pub fn vlan_tci(&self) -> Option<u16> {
        self.0.vlan_tci
    }

    pub fn set_vlan_tci(&mut self, vlan_tci: Option<u16>) {
        Arc::make_mut(&mut self.0).vlan_tci = vlan_tci;
    }

    /// Resizes the packet, zero-filling any new bytes.
    pub fn resize(&mut self, len: usize) {
        Arc::make_mut(&mut self.0).data.resize(len, 0);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Duplicating the packet data yields a standalone buffer that does not hold a pool slot.
impl Clone for MetaData {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            port: self.port,
            vlan_tci: self.vlan_tci,
            slot: None,
        }
    }
}

impl Deref for Mbuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0.data
    }
}

impl DerefMut for Mbuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut Arc::make_mut(&mut self.0).data
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("len", &self.len())
            .field("port", &self.0.port)
            .field("refcnt", &self.refcnt())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::Mbuf;
    use crate::ensure_eq;
    use ::anyhow::Result;

    #[test]
    fn clone_bumps_and_drop_releases_refcnt() -> Result<()> {
        let pkt: Mbuf = Mbuf::from_slice(&[1, 2, 3]);
        ensure_eq!(pkt.refcnt(), 1);
        let copies: Vec<Mbuf> = vec![pkt.clone(), pkt.clone()];
        ensure_eq!(pkt.refcnt(), 3);
        drop(copies);
        ensure_eq!(pkt.refcnt(), 1);
        Ok(())
    }

    #[test]
    fn write_to_shared_packet_detaches_the_writer() -> Result<()> {
        let pkt: Mbuf = Mbuf::from_slice(&[0xaa; 4]);
        let mut writer: Mbuf = pkt.clone();
        writer[0] = 0xbb;
        ensure_eq!(pkt[0], 0xaa);
        ensure_eq!(writer[0], 0xbb);
        ensure_eq!(pkt.refcnt(), 1);
        ensure_eq!(writer.ptr_eq(&pkt), false);
        Ok(())
    }

    #[test]
    fn write_to_exclusive_packet_is_in_place() -> Result<()> {
        let mut pkt: Mbuf = Mbuf::new(2);
        pkt[1] = 7;
        pkt.set_port(3);
        ensure_eq!(&pkt[..], &[0u8, 7][..]);
        ensure_eq!(pkt.port(), 3);
        Ok(())
    }
}
