// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::ops::AddAssign;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Basic port counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PortStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub ibytes: u64,
    pub obytes: u64,
    pub imissed: u64,
    pub ierrors: u64,
    pub oerrors: u64,
    pub rx_nombuf: u64,
}

/// Port capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub max_rx_pktlen: u32,
    pub max_mac_addrs: u32,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl AddAssign for PortStats {
    fn add_assign(&mut self, other: Self) {
        self.ipackets += other.ipackets;
        self.opackets += other.opackets;
        self.ibytes += other.ibytes;
        self.obytes += other.obytes;
        self.imissed += other.imissed;
        self.ierrors += other.ierrors;
        self.oerrors += other.oerrors;
        self.rx_nombuf += other.rx_nombuf;
    }
}
