// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::fmt;

//======================================================================================================================
// Enumerations
//======================================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Duplex {
    Half,
    #[default]
    Full,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Link status of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub up: bool,
    /// Link speed in Mbps. Zero if unknown.
    pub speed_mbps: u32,
    pub duplex: Duplex,
    pub autoneg: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LinkStatus {
    pub fn up(speed_mbps: u32) -> Self {
        Self {
            up: true,
            speed_mbps,
            duplex: Duplex::Full,
            autoneg: true,
        }
    }

    pub fn down() -> Self {
        Self {
            up: false,
            speed_mbps: 0,
            duplex: Duplex::Full,
            autoneg: true,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.up {
            return write!(f, "down");
        }
        write!(
            f,
            "up {} Mbps {} {}",
            self.speed_mbps,
            match self.duplex {
                Duplex::Full => "full-duplex",
                Duplex::Half => "half-duplex",
            },
            if self.autoneg { "autoneg" } else { "fixed" }
        )
    }
}
