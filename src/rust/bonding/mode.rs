// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::libc::EINVAL;
use ::std::{
    fmt,
    str::FromStr,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Bonding modes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BondingMode {
    /// Packets are spread over members in turn.
    RoundRobin = 0,
    /// A single member carries all traffic; the others stand by.
    ActiveBackup = 1,
    /// Packets are spread by a hash of their headers.
    Balance = 2,
    /// Every packet is sent on every member.
    Broadcast = 3,
    /// IEEE 802.3ad link aggregation.
    Lacp = 4,
    /// Adaptive transmit load balancing.
    Tlb = 5,
    /// Adaptive load balancing.
    Alb = 6,
}

/// Hash policy used to spread packets in [BondingMode::Balance] and [BondingMode::Lacp].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum XmitPolicy {
    /// Source and destination MAC addresses.
    #[default]
    Layer2,
    /// MAC addresses plus IP addresses.
    Layer23,
    /// MAC addresses, IP addresses and TCP/UDP ports.
    Layer34,
}

/// Receive burst strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RxBurst {
    RoundRobin,
    ActiveBackup,
    Lacp,
    LacpFastQueue,
    Alb,
}

/// Transmit burst strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxBurst {
    RoundRobin,
    ActiveBackup,
    Balance,
    Broadcast,
    Lacp,
    LacpFastQueue,
    Tlb,
    Alb,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Burst pair installed for a mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BurstOps {
    pub rx: RxBurst,
    pub tx: TxBurst,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl BondingMode {
    pub const ALL: [BondingMode; 7] = [
        BondingMode::RoundRobin,
        BondingMode::ActiveBackup,
        BondingMode::Balance,
        BondingMode::Broadcast,
        BondingMode::Lacp,
        BondingMode::Tlb,
        BondingMode::Alb,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BondingMode::RoundRobin => "ROUND_ROBIN",
            BondingMode::ActiveBackup => "ACTIVE_BACKUP",
            BondingMode::Balance => "BALANCE",
            BondingMode::Broadcast => "BROADCAST",
            BondingMode::Lacp => "8023AD",
            BondingMode::Tlb => "TLB",
            BondingMode::Alb => "ALB",
        }
    }

    /// Returns `true` if promiscuous and all-multicast settings apply to every member, and `false` if they only apply
    /// to the current primary.
    pub fn propagates_to_all_members(&self) -> bool {
        matches!(
            self,
            BondingMode::RoundRobin | BondingMode::Balance | BondingMode::Broadcast | BondingMode::Lacp
        )
    }

    /// Returns `true` if the mode ranks members by transmit headroom.
    pub fn uses_tlb(&self) -> bool {
        matches!(self, BondingMode::Tlb | BondingMode::Alb)
    }
}

impl BurstOps {
    /// Selects the burst pair of `mode`.
    pub fn select(mode: BondingMode, dedicated_queues: bool) -> Self {
        let (rx, tx): (RxBurst, TxBurst) = match mode {
            BondingMode::RoundRobin => (RxBurst::RoundRobin, TxBurst::RoundRobin),
            BondingMode::ActiveBackup => (RxBurst::ActiveBackup, TxBurst::ActiveBackup),
            BondingMode::Balance => (RxBurst::RoundRobin, TxBurst::Balance),
            BondingMode::Broadcast => (RxBurst::RoundRobin, TxBurst::Broadcast),
            BondingMode::Lacp if dedicated_queues => (RxBurst::LacpFastQueue, TxBurst::LacpFastQueue),
            BondingMode::Lacp => (RxBurst::Lacp, TxBurst::Lacp),
            BondingMode::Tlb => (RxBurst::ActiveBackup, TxBurst::Tlb),
            BondingMode::Alb => (RxBurst::Alb, TxBurst::Alb),
        };
        Self { rx, tx }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for BondingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<u8> for BondingMode {
    type Error = Fail;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match BondingMode::ALL.get(value as usize) {
            Some(mode) => Ok(*mode),
            None => {
                let cause: String = format!("invalid bonding mode (mode={})", value);
                error!("try_from(): {}", cause);
                Err(Fail::new(EINVAL, &cause))
            },
        }
    }
}

/// Parses either a mode name (case insensitive) or its number.
impl FromStr for BondingMode {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s: &str = s.trim();
        if let Ok(value) = s.parse::<u8>() {
            return BondingMode::try_from(value);
        }
        match BondingMode::ALL.iter().find(|mode| mode.name().eq_ignore_ascii_case(s)) {
            Some(mode) => Ok(*mode),
            None => {
                let cause: String = format!("invalid bonding mode (mode={:?})", s);
                error!("from_str(): {}", cause);
                Err(Fail::new(EINVAL, &cause))
            },
        }
    }
}

impl fmt::Display for XmitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &str = match self {
            XmitPolicy::Layer2 => "l2",
            XmitPolicy::Layer23 => "l23",
            XmitPolicy::Layer34 => "l34",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for XmitPolicy {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" => Ok(XmitPolicy::Layer2),
            "l23" => Ok(XmitPolicy::Layer23),
            "l34" => Ok(XmitPolicy::Layer34),
            _ => {
                let cause: String = format!("invalid transmit policy (policy={:?})", s);
                error!("from_str(): {}", cause);
                Err(Fail::new(EINVAL, &cause))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
