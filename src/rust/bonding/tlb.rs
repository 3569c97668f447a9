// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Transmit load balancing. Active members are periodically ranked by the bandwidth they have left; transmission
//! fills the best ranked member first.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        BondView,
        MemberHandle,
    },
    runtime::network::LinkStatus,
};
use ::arc_swap::ArcSwap;
use ::std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Period of the ranking alarm.
pub const REORDER_PERIOD: Duration = Duration::from_millis(10);

/// Number of ranking rounds between two samples of the transmit counters.
pub const REORDER_PERIOD_MS: u64 = 10;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Bandwidth headroom of a member: integral part first, remainder second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BandwidthLeft {
    pub integral: u64,
    pub remainder: u64,
}

#[derive(Default)]
struct TlbHistory {
    update_idx: u64,
    last_obytes: HashMap<u16, u64>,
}

/// Ranking shared by the alarm (writer) and the transmit path (reader).
pub(crate) struct TlbState {
    order: ArcSwap<Vec<u16>>,
    history: Mutex<TlbHistory>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TlbState {
    pub fn new() -> Self {
        Self {
            order: ArcSwap::from_pointee(Vec::new()),
            history: Mutex::new(TlbHistory::default()),
        }
    }

    fn lock_history(&self) -> MutexGuard<TlbHistory> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Forgets the counters sampled so far.
    pub fn reset(&self) {
        let mut history: MutexGuard<TlbHistory> = self.lock_history();
        history.update_idx = 0;
        history.last_obytes.clear();
    }

    /// Appends a newly activated member to the order and restarts accounting of every active member.
    pub fn activate(&self, port_id: u16, active: &[u16]) {
        let mut history: MutexGuard<TlbHistory> = self.lock_history();
        for id in active {
            history.last_obytes.insert(*id, 0);
        }
        let mut order: Vec<u16> = self.order.load().as_ref().clone();
        if !order.contains(&port_id) {
            order.push(port_id);
        }
        self.order.store(Arc::new(order));
    }

    /// Members in rank order.
    pub fn order(&self) -> Arc<Vec<u16>> {
        self.order.load_full()
    }

    /// Ranks the active members of `view` by the bandwidth they have left.
    pub fn update(&self, view: &BondView) {
        let mut history: MutexGuard<TlbHistory> = self.lock_history();
        history.update_idx += 1;
        let update_stats: bool = history.update_idx >= REORDER_PERIOD_MS;

        let mut ranking: Vec<(u16, BandwidthLeft)> = Vec::with_capacity(view.active.len());
        for member in view.active.iter() {
            let obytes: u64 = match member.port.stats() {
                Ok(stats) => stats.obytes,
                Err(e) => {
                    warn!("update(): cannot read stats of port {} ({:?})", member.port_id, e);
                    0
                },
            };
            let last_obytes: u64 = history.last_obytes.get(&member.port_id).copied().unwrap_or(0);
            let load: u64 = obytes.saturating_sub(last_obytes);
            let left: BandwidthLeft = match member.port.link_get_nowait() {
                Ok(link) => bandwidth_left(&link, load, history.update_idx),
                Err(e) => {
                    warn!("update(): cannot read link of port {} ({:?})", member.port_id, e);
                    BandwidthLeft::default()
                },
            };
            ranking.push((member.port_id, left));
            if update_stats {
                history.last_obytes.insert(member.port_id, obytes);
            }
        }
        if update_stats {
            history.update_idx = 0;
        }

        // Stable: members with equal headroom keep their activation order.
        ranking.sort_by(|a, b| b.1.cmp(&a.1));
        let order: Vec<u16> = ranking.into_iter().map(|(port_id, _)| port_id).collect();
        trace!("update(): order={:?}", order);
        self.order.store(Arc::new(order));
    }

    /// Active members of `view` in rank order. Members activated since the last ranking are not in the order yet; if
    /// no ranked member is active, the activation order is used.
    pub fn ranked_members(&self, view: &BondView) -> Vec<MemberHandle> {
        let order: Arc<Vec<u16>> = self.order();
        let ranked: Vec<MemberHandle> = order
            .iter()
            .filter_map(|port_id| view.active.iter().find(|m| m.port_id == *port_id).cloned())
            .collect();
        if ranked.is_empty() {
            view.active.clone()
        } else {
            ranked
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Computes the bandwidth left on a link that carried `load` bytes over `update_idx + 1` ranking rounds. A link of
/// unknown speed has none.
pub fn bandwidth_left(link: &LinkStatus, load: u64, update_idx: u64) -> BandwidthLeft {
    let link_bwg: u64 = link.speed_mbps as u64 * 1_000_000 / 8;
    if link_bwg == 0 {
        return BandwidthLeft::default();
    }
    let link_bwg: u64 = link_bwg * (update_idx + 1) * REORDER_PERIOD_MS;
    let left: u64 = link_bwg.saturating_sub(load.saturating_mul(1000));
    BandwidthLeft {
        integral: left / link_bwg,
        remainder: left % link_bwg,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
