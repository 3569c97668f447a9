// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Member liveness: link-status-change handling, the polling monitor, activation and primary selection, bond link
//! computation and delayed propagation of bond link events.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        tlb::REORDER_PERIOD,
        BondConfig,
        BondDevice,
        BondInner,
        BondingMode,
        LinkEventCallback,
        LinkState,
        MemberHandle,
        MemberRecord,
    },
    runtime::{
        fail::Fail,
        network::LinkStatus,
        timer::Alarm,
    },
};
use ::std::{
    sync::{
        Arc,
        MutexGuard,
        RwLockReadGuard,
        TryLockError,
        Weak,
    },
    time::Duration,
};

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl BondInner {
    /// Link-status-change callback registered on members.
    pub(crate) fn on_member_lsc(self: &Arc<Self>, port_id: u16) {
        let cfg: RwLockReadGuard<BondConfig> = match self.config.read() {
            Ok(cfg) => cfg,
            Err(_) => {
                warn!("on_member_lsc(): configuration lock poisoned (port_id={})", port_id);
                return;
            },
        };
        self.handle_lsc(&cfg, port_id);
    }

    /// Re-evaluates the link of a member and updates the active list, the primary and the bond link accordingly.
    pub(crate) fn handle_lsc(self: &Arc<Self>, cfg: &BondConfig, port_id: u16) {
        if !cfg.started {
            return;
        }
        let member: &MemberRecord = match cfg.member(port_id) {
            Some(member) => member,
            None => return,
        };
        let mut link: MutexGuard<LinkState> = self.lock_link();
        let status: LinkStatus = match member.port().link_get_nowait() {
            Ok(status) => status,
            Err(e) => {
                warn!("handle_lsc(): cannot read link of port {}, assuming down ({:?})", port_id, e);
                LinkStatus::down()
            },
        };
        debug!("handle_lsc(): port {} link {}", port_id, status);

        let mut lsc_flag: bool = false;
        if status.up && !link.is_active(port_id) {
            let mut valid: bool = true;
            if link.link.up {
                if cfg.mode == BondingMode::Lacp && !link_properties_valid(&link.lacp_link, &status) {
                    warn!(
                        "handle_lsc(): link properties of port {} ({}) do not match the aggregation ({})",
                        port_id, status, link.lacp_link
                    );
                    valid = false;
                }
            } else if cfg.mode == BondingMode::Lacp {
                link.lacp_link = status;
            }
            if valid {
                if link.active.is_empty() {
                    link.link.up = true;
                    link.current_primary = Some(port_id);
                    lsc_flag = true;
                    self.sync_members(cfg, &link);
                }
                self.activate_member(cfg, &mut link, port_id);
                if cfg.user_defined_primary
                    && cfg.primary_port == Some(port_id)
                    && link.current_primary != Some(port_id)
                {
                    primary_set(&mut link, port_id);
                    self.sync_members(cfg, &link);
                }
            }
        } else if !status.up && link.is_active(port_id) {
            self.deactivate_member(cfg, &mut link, port_id);
            if link.active.is_empty() {
                lsc_flag = true;
            }
            if link.current_primary == Some(port_id) {
                match link.active.first().copied() {
                    Some(next) => primary_set(&mut link, next),
                    None => link.current_primary = cfg.primary_port,
                }
                self.sync_members(cfg, &link);
            }
        }

        self.link_update(cfg, &mut link);
        member.set_last_link_status(status.up);
        self.publish(cfg, &link);
        if lsc_flag {
            self.notify_link(cfg, link.link);
        }
    }

    /// Makes a member carry traffic.
    pub(crate) fn activate_member(&self, cfg: &BondConfig, link: &mut LinkState, port_id: u16) {
        let handle: MemberHandle = match cfg.handle(port_id) {
            Some(handle) => handle,
            None => return,
        };
        if cfg.mode == BondingMode::Lacp {
            handle.lacp.activate(handle.mac_addr());
        }
        if link.active.try_push(port_id).is_err() {
            warn!("activate_member(): active list full (port_id={})", port_id);
            return;
        }
        match cfg.mode {
            BondingMode::Tlb => self.tlb.activate(port_id, &link.active),
            BondingMode::Alb => self.tlb.activate(port_id, &[]),
            _ => (),
        }
        self.publish(cfg, link);
        if cfg.mode == BondingMode::Alb {
            self.alb.client_list_update(&self.view.load());
        }
        info!("activate_member(): port {} is active", port_id);
    }

    /// Stops a member from carrying traffic. The active list keeps its order.
    pub(crate) fn deactivate_member(&self, cfg: &BondConfig, link: &mut LinkState, port_id: u16) {
        if cfg.mode == BondingMode::Lacp {
            if let Some(handle) = cfg.handle(port_id) {
                handle.lacp.deactivate();
            }
        }
        if let Some(position) = link.active.iter().position(|id| *id == port_id) {
            link.active.remove(position);
        }
        self.publish(cfg, link);
        if cfg.started && cfg.mode.uses_tlb() {
            let view = self.view.load();
            self.tlb.update(&view);
            if cfg.mode == BondingMode::Alb {
                self.alb.client_list_update(&view);
            }
        }
        info!("deactivate_member(): port {} is inactive", port_id);
    }

    /// Computes the bond link from the active members.
    pub(crate) fn link_update(&self, cfg: &BondConfig, link: &mut LinkState) {
        if !cfg.started || link.active.is_empty() {
            link.link = LinkStatus::down();
            return;
        }
        let query = |port_id: u16| -> Result<LinkStatus, Fail> {
            match cfg.member(port_id) {
                Some(member) => member.port().link_get_nowait(),
                None => Err(Fail::new(libc::ENODEV, "no such member")),
            }
        };
        let mut status: LinkStatus = LinkStatus::up(0);
        match cfg.mode {
            // Faster members would drop what the slowest one cannot carry.
            BondingMode::Broadcast => {
                let mut speed: Option<u32> = None;
                for port_id in link.active.iter() {
                    match query(*port_id) {
                        Ok(member_link) => {
                            speed = Some(speed.map_or(member_link.speed_mbps, |s| s.min(member_link.speed_mbps)))
                        },
                        Err(e) => warn!("link_update(): cannot read link of port {} ({:?})", port_id, e),
                    }
                }
                status.speed_mbps = speed.unwrap_or(0);
            },
            BondingMode::ActiveBackup => {
                if let Some(primary) = link.current_primary {
                    match query(primary) {
                        Ok(member_link) => status.speed_mbps = member_link.speed_mbps,
                        Err(e) => warn!("link_update(): cannot read link of port {} ({:?})", primary, e),
                    }
                }
            },
            mode => {
                if mode == BondingMode::Lacp {
                    status.duplex = link.lacp_link.duplex;
                    status.autoneg = link.lacp_link.autoneg;
                }
                for port_id in link.active.iter() {
                    match query(*port_id) {
                        Ok(member_link) => status.speed_mbps = status.speed_mbps.saturating_add(member_link.speed_mbps),
                        Err(e) => warn!("link_update(): cannot read link of port {} ({:?})", port_id, e),
                    }
                }
            },
        }
        link.link = status;
    }

    /// Reports a bond link change, right away or after the configured delay. A pending delayed report is dropped.
    pub(crate) fn notify_link(self: &Arc<Self>, cfg: &BondConfig, status: LinkStatus) {
        let delay: Duration = if status.up {
            cfg.link_up_delay
        } else {
            cfg.link_down_delay
        };
        {
            let mut alarms = self.lock_alarms();
            if let Some(mut pending) = alarms.lsc_delay.take() {
                pending.cancel();
            }
            if !delay.is_zero() {
                let weak: Weak<BondInner> = Arc::downgrade(self);
                match Alarm::oneshot(&format!("{}-lsc", self.name), delay, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.fire_link_event();
                    }
                }) {
                    Ok(alarm) => alarms.lsc_delay = Some(alarm),
                    Err(e) => warn!("notify_link(): cannot arm delay alarm ({:?})", e),
                }
                return;
            }
        }
        self.fire_link_event();
    }

    /// Invokes the link event callbacks with the current bond link.
    pub(crate) fn fire_link_event(&self) {
        let status: LinkStatus = self.view.load().link;
        let callbacks: Vec<LinkEventCallback> = match self.events.lock() {
            Ok(events) => events.callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
        };
        info!("fire_link_event(): bond {} link {}", self.name, status);
        for callback in callbacks {
            callback(self.port_id, status);
        }
    }

    /// Arms the link polling monitor, unless it is already running.
    pub(crate) fn arm_monitor(self: &Arc<Self>, cfg: &BondConfig) {
        let mut alarms = self.lock_alarms();
        if alarms.monitor.as_ref().map_or(false, |monitor| monitor.is_armed()) {
            return;
        }
        let weak: Weak<BondInner> = Arc::downgrade(self);
        match Alarm::periodic(&format!("{}-monitor", self.name), cfg.polling_interval, move || {
            monitor_members(&weak)
        }) {
            Ok(alarm) => alarms.monitor = Some(alarm),
            Err(e) => warn!("arm_monitor(): cannot arm link monitor ({:?})", e),
        }
    }

    /// Arms the ranking alarm of the load balancing modes.
    pub(crate) fn arm_tlb(self: &Arc<Self>) {
        let weak: Weak<BondInner> = Arc::downgrade(self);
        let alarm: Result<Alarm, Fail> = Alarm::periodic(&format!("{}-tlb", self.name), REORDER_PERIOD, move || {
            match weak.upgrade() {
                Some(inner) => {
                    inner.tlb.update(&inner.view.load());
                    true
                },
                None => false,
            }
        });
        match alarm {
            Ok(alarm) => self.lock_alarms().tlb = Some(alarm),
            Err(e) => warn!("arm_tlb(): cannot arm ranking alarm ({:?})", e),
        }
    }
}

impl BondDevice {
    /// Delays the report of the bond link going up.
    pub fn set_link_up_delay(&self, delay: Duration) -> Result<(), Fail> {
        self.inner.write_config()?.link_up_delay = delay;
        Ok(())
    }

    pub fn link_up_delay(&self) -> Result<Duration, Fail> {
        Ok(self.inner.read_config()?.link_up_delay)
    }

    /// Delays the report of the bond link going down.
    pub fn set_link_down_delay(&self, delay: Duration) -> Result<(), Fail> {
        self.inner.write_config()?.link_down_delay = delay;
        Ok(())
    }

    pub fn link_down_delay(&self) -> Result<Duration, Fail> {
        Ok(self.inner.read_config()?.link_down_delay)
    }

    /// Sets the period at which members without link-status-change interrupts are polled.
    pub fn set_link_monitoring_interval(&self, interval: Duration) -> Result<(), Fail> {
        if interval.is_zero() {
            let cause: String = format!("invalid polling interval for {}", self.inner.name);
            error!("set_link_monitoring_interval(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut cfg = self.inner.write_config()?;
        cfg.polling_interval = interval;
        if cfg.started && cfg.link_status_polling_enabled {
            let mut previous: Option<Alarm> = self.inner.lock_alarms().monitor.take();
            if let Some(ref mut monitor) = previous {
                monitor.cancel();
            }
            self.inner.arm_monitor(&cfg);
        }
        Ok(())
    }

    pub fn link_monitoring_interval(&self) -> Result<Duration, Fail> {
        Ok(self.inner.read_config()?.polling_interval)
    }

    /// Registers a callback invoked when the bond link goes up or down. Callbacks run on control threads with the
    /// link-status-change lock held: they may read the bond state through lock-free getters such as
    /// [BondDevice::link], [BondDevice::primary] or [BondDevice::active_members] but must not reconfigure the bond.
    pub fn on_link_event<F>(&self, callback: F) -> u64
    where
        F: Fn(u16, LinkStatus) + Send + Sync + 'static,
    {
        let mut events = match self.inner.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        let token: u64 = events.next_token;
        events.next_token += 1;
        events.callbacks.push((token, Arc::new(callback)));
        token
    }

    pub fn remove_link_event(&self, token: u64) -> Result<(), Fail> {
        let mut events = match self.inner.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        match events.callbacks.iter().position(|(t, _)| *t == token) {
            Some(index) => {
                events.callbacks.remove(index);
                Ok(())
            },
            None => {
                let cause: String = format!("no link event callback with token {}", token);
                error!("remove_link_event(): {}", cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Makes `port_id` the current primary if it is active, or unconditionally if no member is.
pub(crate) fn primary_set(link: &mut LinkState, port_id: u16) {
    if link.active.is_empty() || link.is_active(port_id) {
        link.current_primary = Some(port_id);
    }
}

/// In 802.3ad mode every member of the aggregation must run at the same speed and duplex.
fn link_properties_valid(aggregation: &LinkStatus, member: &LinkStatus) -> bool {
    aggregation.speed_mbps == member.speed_mbps
        && aggregation.duplex == member.duplex
        && aggregation.autoneg == member.autoneg
}

/// Polls members that raise no link-status-change interrupts. Returns `false` once there is nothing left to poll.
fn monitor_members(weak: &Weak<BondInner>) -> bool {
    let inner: Arc<BondInner> = match weak.upgrade() {
        Some(inner) => inner,
        None => return false,
    };
    let cfg: RwLockReadGuard<BondConfig> = match inner.config.try_read() {
        Ok(cfg) => cfg,
        // Being reconfigured: try again on the next period.
        Err(TryLockError::WouldBlock) => return true,
        Err(TryLockError::Poisoned(_)) => return false,
    };
    if !cfg.started || !cfg.link_status_polling_enabled {
        return false;
    }
    let mut polling_member_found: bool = cfg.members.is_empty();
    for member in cfg.members.iter().filter(|m| m.link_status_poll_enabled()) {
        polling_member_found = true;
        let up: bool = member.port().link_get_nowait().map_or(false, |status| status.up);
        if up != member.last_link_status() {
            inner.handle_lsc(&cfg, member.port_id());
        }
    }
    polling_member_found
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::ensure_eq;
    use ::anyhow::Result;
    use ::arrayvec::ArrayVec;

    fn link_state(active: &[u16]) -> LinkState {
        let mut link: LinkState = LinkState::new();
        link.active = active.iter().copied().collect::<ArrayVec<u16, 32>>();
        link
    }

    #[test]
    fn primary_must_be_active_unless_none_is() -> Result<()> {
        let mut link: LinkState = link_state(&[]);
        primary_set(&mut link, 7);
        ensure_eq!(link.current_primary, Some(7));

        let mut link: LinkState = link_state(&[1, 2]);
        link.current_primary = Some(1);
        primary_set(&mut link, 3);
        ensure_eq!(link.current_primary, Some(1));
        primary_set(&mut link, 2);
        ensure_eq!(link.current_primary, Some(2));
        Ok(())
    }

    #[test]
    fn aggregation_requires_same_speed_and_duplex() -> Result<()> {
        let aggregation: LinkStatus = LinkStatus::up(10_000);
        ensure_eq!(link_properties_valid(&aggregation, &LinkStatus::up(10_000)), true);
        ensure_eq!(link_properties_valid(&aggregation, &LinkStatus::up(1_000)), false);
        let mut half: LinkStatus = LinkStatus::up(10_000);
        half.duplex = crate::runtime::network::Duplex::Half;
        ensure_eq!(link_properties_valid(&aggregation, &half), false);
        Ok(())
    }
}
