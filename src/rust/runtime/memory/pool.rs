// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::Mbuf,
};
use ::std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct PoolState {
    name: String,
    capacity: usize,
    in_use: AtomicUsize,
}

/// A bounded pool of packet buffers. A buffer goes back to the pool once its last reference is dropped.
#[derive(Clone)]
pub struct MbufPool(Arc<PoolState>);

/// Outstanding allocation from a [MbufPool].
pub(super) struct PoolSlot(Arc<PoolState>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl MbufPool {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self(Arc::new(PoolState {
            name: name.to_string(),
            capacity,
            in_use: AtomicUsize::new(0),
        }))
    }

    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<Mbuf, Fail> {
        let reserved: Result<usize, usize> =
            self.0
                .in_use
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use: usize| {
                    if in_use < self.0.capacity {
                        Some(in_use + 1)
                    } else {
                        None
                    }
                });
        if reserved.is_err() {
            let cause: String = format!("pool {} exhausted (capacity={})", self.0.name, self.0.capacity);
            debug!("alloc(): {}", cause);
            return Err(Fail::new(libc::ENOMEM, &cause));
        }
        Ok(Mbuf::with_slot(vec![0; len], Some(PoolSlot(self.0.clone()))))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.0.in_use.load(Ordering::Acquire)
    }

    /// Number of buffers that can still be allocated.
    pub fn available(&self) -> usize {
        self.0.capacity.saturating_sub(self.in_use())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.0.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
