// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Read/write views over the protocol headers the bonding layer looks at. Views never copy the frame and never
//! panic on truncated input.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod arp;
pub mod builder;
pub mod ethernet2;
pub mod ip;
pub mod slow;

pub use self::{
    arp::{
        ArpHeader,
        ArpOperation,
    },
    builder::FrameBuilder,
    ethernet2::{
        EtherType2,
        Ethernet2Header,
        ETHERNET2_HEADER_SIZE,
    },
    ip::IpProtocol,
};
