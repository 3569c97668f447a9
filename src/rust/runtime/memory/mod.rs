// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

mod mbuf;
mod pool;

pub use self::{
    mbuf::Mbuf,
    pool::MbufPool,
};
