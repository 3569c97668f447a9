// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        mode::{
            RxBurst,
            TxBurst,
        },
        rx,
        tx,
        BondInner,
        BondView,
    },
    runtime::memory::Mbuf,
};
use ::arc_swap::Guard;
use ::std::sync::{
    atomic::AtomicUsize,
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Receive queue of a bond. A queue is polled by one thread at a time; distinct queues may be polled concurrently.
pub struct BondRxQueue {
    inner: Arc<BondInner>,
    queue_id: u16,
    /// Member the next burst starts from.
    cursor: AtomicUsize,
}

/// Transmit queue of a bond. A queue is used by one thread at a time; distinct queues may be used concurrently.
pub struct BondTxQueue {
    inner: Arc<BondInner>,
    queue_id: u16,
    /// Member the next round-robin burst starts from.
    cursor: AtomicUsize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl BondRxQueue {
    pub(crate) fn new(inner: Arc<BondInner>, queue_id: u16) -> Self {
        Self {
            inner,
            queue_id,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// Receives at most `nb_pkts` packets, appending them to `pkts`. Returns the number of packets received.
    pub fn rx_burst(&self, pkts: &mut Vec<Mbuf>, nb_pkts: usize) -> usize {
        let view: Guard<Arc<BondView>> = self.inner.view.load();
        match view.burst.rx {
            RxBurst::RoundRobin => rx::rx_burst_round_robin(&view, self.queue_id, &self.cursor, pkts, nb_pkts),
            RxBurst::ActiveBackup => rx::rx_burst_active_backup(&view, self.queue_id, pkts, nb_pkts),
            RxBurst::Lacp => rx::rx_burst_lacp(&view, self.queue_id, &self.cursor, pkts, nb_pkts, false),
            RxBurst::LacpFastQueue => rx::rx_burst_lacp(&view, self.queue_id, &self.cursor, pkts, nb_pkts, true),
            RxBurst::Alb => rx::rx_burst_alb(&self.inner, &view, self.queue_id, &self.cursor, pkts, nb_pkts),
        }
    }
}

impl BondTxQueue {
    pub(crate) fn new(inner: Arc<BondInner>, queue_id: u16) -> Self {
        Self {
            inner,
            queue_id,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// Transmits `pkts`. Sent packets are taken out of `pkts`; the ones left in it were not sent and still belong to
    /// the caller. Returns the number of packets sent.
    pub fn tx_burst(&self, pkts: &mut Vec<Mbuf>) -> usize {
        let view: Guard<Arc<BondView>> = self.inner.view.load();
        match view.burst.tx {
            TxBurst::RoundRobin => tx::tx_burst_round_robin(&view, self.queue_id, &self.cursor, pkts),
            TxBurst::ActiveBackup => tx::tx_burst_active_backup(&view, self.queue_id, pkts),
            TxBurst::Balance => tx::tx_burst_balance(&view, self.queue_id, pkts),
            TxBurst::Broadcast => tx::tx_burst_broadcast(&view, self.queue_id, pkts),
            TxBurst::Lacp => tx::tx_burst_lacp(&view, self.queue_id, pkts, false),
            TxBurst::LacpFastQueue => tx::tx_burst_lacp(&view, self.queue_id, pkts, true),
            TxBurst::Tlb => tx::tx_burst_tlb(&self.inner, &view, self.queue_id, pkts),
            TxBurst::Alb => tx::tx_burst_alb(&self.inner, &view, self.queue_id, pkts),
        }
    }
}
