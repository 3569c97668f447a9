// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Lifecycle of a bond: queue layout, start and stop, mode changes and introspection.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        link::primary_set,
        member::member_start,
        BondConfig,
        BondDevice,
        BondInner,
        BondRxQueue,
        BondTxQueue,
        BondView,
        BondingMode,
        LinkState,
        MemberHandle,
        XmitPolicy,
        BOND_MAX_MAC_ADDRS,
    },
    runtime::{
        fail::Fail,
        memory::Mbuf,
        network::{
            consts::RECEIVE_BATCH_SIZE,
            prepare_and_transmit,
            types::MacAddress,
            LinkStatus,
            PortInfo,
            PortStats,
        },
        timer::Alarm,
    },
};
use ::arc_swap::Guard;
use ::std::sync::{
    Arc,
    MutexGuard,
    RwLockReadGuard,
    RwLockWriteGuard,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Queue limit reported by a bond without members.
const MAX_QUEUES_PER_PORT: u16 = 1024;

/// Frame length limit reported by a bond without members.
const MAX_JUMBO_FRAME_LEN: u32 = 0x3f00;

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl BondDevice {
    /// Sets the number of receive and transmit queues of the bond. Members get the same layout when the bond starts.
    pub fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        if cfg.started {
            let cause: String = format!("bond {} is running", self.inner.name);
            error!("configure(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if nb_rx_queues == 0 || nb_tx_queues == 0 {
            let cause: String = format!("invalid queue count (nb_rx_queues={}, nb_tx_queues={})", nb_rx_queues, nb_tx_queues);
            error!("configure(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        cfg.nb_rx_queues = nb_rx_queues;
        cfg.nb_tx_queues = nb_tx_queues;
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        self.inner.publish(&cfg, &link);
        Ok(())
    }

    pub fn nb_rx_queues(&self) -> Result<u16, Fail> {
        Ok(self.inner.read_config()?.nb_rx_queues)
    }

    pub fn nb_tx_queues(&self) -> Result<u16, Fail> {
        Ok(self.inner.read_config()?.nb_tx_queues)
    }

    /// Creates a handle to receive queue `queue_id`.
    pub fn rx_queue(&self, queue_id: u16) -> Result<BondRxQueue, Fail> {
        let cfg: RwLockReadGuard<BondConfig> = self.inner.read_config()?;
        if queue_id >= cfg.nb_rx_queues {
            let cause: String = format!("invalid receive queue {} (nb_rx_queues={})", queue_id, cfg.nb_rx_queues);
            error!("rx_queue(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(BondRxQueue::new(self.inner.clone(), queue_id))
    }

    /// Creates a handle to transmit queue `queue_id`.
    pub fn tx_queue(&self, queue_id: u16) -> Result<BondTxQueue, Fail> {
        let cfg: RwLockReadGuard<BondConfig> = self.inner.read_config()?;
        if queue_id >= cfg.nb_tx_queues {
            let cause: String = format!("invalid transmit queue {} (nb_tx_queues={})", queue_id, cfg.nb_tx_queues);
            error!("tx_queue(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(BondTxQueue::new(self.inner.clone(), queue_id))
    }

    /// Starts every member and evaluates their links. On failure the bond is left stopped.
    pub fn start(&self) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        if cfg.started {
            return Ok(());
        }
        if cfg.members.is_empty() {
            let cause: String = format!("bond {} has no members", self.inner.name);
            error!("start(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if let Err(e) = self.inner.start_locked(&mut cfg) {
            if let Err(stop_error) = self.inner.stop_locked(&mut cfg) {
                warn!("start(): {:?}", stop_error);
            }
            return Err(e);
        }
        info!("start(): bond {} started (mode={})", self.inner.name, cfg.mode);
        Ok(())
    }

    /// Stops every member. The bond link goes down.
    pub fn stop(&self) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        self.inner.stop_locked(&mut cfg)
    }

    /// Stops the bond and releases every member.
    pub fn close(&self) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        let result: Result<(), Fail> = self.inner.stop_locked(&mut cfg);
        while let Some(port_id) = cfg.members.last().map(|m| m.port_id()) {
            self.inner.remove_member_locked(&mut cfg, port_id)?;
        }
        self.inner.alb.reset();
        info!("close(): bond {} closed", self.inner.name);
        result
    }

    /// Changes the bonding mode. The bond must be stopped.
    pub fn set_mode(&self, mode: BondingMode) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        if cfg.started {
            let cause: String = format!("cannot change mode of running bond {}", self.inner.name);
            error!("set_mode(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if cfg.mode == mode {
            return Ok(());
        }
        if cfg.mode == BondingMode::Lacp {
            for member in cfg.members.iter() {
                member.handle().lacp.deactivate();
                member.handle().lacp.drain();
            }
        }
        cfg.mode = mode;
        self.inner.tlb.reset();
        if mode == BondingMode::Alb {
            self.inner.alb.reset();
        }
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        if !cfg.members.is_empty() {
            if let Err(e) = self.inner.mac_address_members_update(&cfg, &link) {
                warn!("set_mode(): {:?}", e);
            }
        }
        self.inner.publish(&cfg, &link);
        info!("set_mode(): bond {} is now in {} mode", self.inner.name, mode);
        Ok(())
    }

    /// Selects the header fields the balance and 802.3ad modes hash on.
    pub fn set_xmit_policy(&self, policy: XmitPolicy) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        cfg.policy = policy;
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        self.inner.publish(&cfg, &link);
        Ok(())
    }

    /// Reserves one receive and one transmit queue on every member for slow frames. 802.3ad mode only, and only
    /// while the bond is stopped.
    pub fn enable_dedicated_queues(&self, enable: bool) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        if cfg.started {
            let cause: String = format!("bond {} is running", self.inner.name);
            error!("enable_dedicated_queues(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if cfg.mode != BondingMode::Lacp {
            let cause: String = format!("dedicated queues require 802.3ad mode (mode={})", cfg.mode);
            error!("enable_dedicated_queues(): {}", cause);
            return Err(Fail::new(libc::ENOTSUP, &cause));
        }
        if enable {
            for member in cfg.members.iter() {
                let info: PortInfo = member.port().info()?;
                if info.max_rx_queues <= cfg.nb_rx_queues || info.max_tx_queues <= cfg.nb_tx_queues {
                    let cause: String = format!("port {} has no spare queue for slow frames", member.port_id());
                    error!("enable_dedicated_queues(): {}", cause);
                    return Err(Fail::new(libc::ENOTSUP, &cause));
                }
            }
        }
        cfg.dedicated_queues = enable;
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        self.inner.publish(&cfg, &link);
        Ok(())
    }

    pub fn dedicated_queues(&self) -> bool {
        self.inner.view.load().slow_queues.is_some()
    }

    /// Sends the control frames queued for `port_id` on its slow transmit queue. Frames that do not fit stay queued.
    /// Returns the number of frames sent.
    pub fn flush_lacp_ctrl(&self, port_id: u16) -> Result<usize, Fail> {
        let view: Guard<Arc<BondView>> = self.inner.view.load();
        let (member, (_, slow_tx)): (&MemberHandle, (u16, u16)) = self.slow_queue_member(&view, port_id)?;
        let mut nb_tx: usize = 0;
        while let Some(ctrl) = member.lacp.dequeue_ctrl_tx() {
            let mut burst: Vec<Mbuf> = vec![ctrl];
            if prepare_and_transmit(member.port.as_ref(), slow_tx, &mut burst) == 1 {
                nb_tx += 1;
                continue;
            }
            if let Some(ctrl) = burst.pop() {
                member.lacp.requeue_ctrl_tx(ctrl);
            }
            break;
        }
        trace!("flush_lacp_ctrl(): port {} sent {} control frames", port_id, nb_tx);
        Ok(nb_tx)
    }

    /// Reads the slow receive queue of `port_id` and hands the frames to the 802.3ad state. Returns the number of
    /// frames read.
    pub fn poll_lacp_slow_rx(&self, port_id: u16) -> Result<usize, Fail> {
        let view: Guard<Arc<BondView>> = self.inner.view.load();
        let (member, (slow_rx, _)): (&MemberHandle, (u16, u16)) = self.slow_queue_member(&view, port_id)?;
        let mut pkts: Vec<Mbuf> = Vec::with_capacity(RECEIVE_BATCH_SIZE);
        let nb_rx: usize = member.port.rx_burst(slow_rx, &mut pkts, RECEIVE_BATCH_SIZE);
        let mac: MacAddress = member.mac_addr();
        for pkt in pkts {
            member.lacp.handle_slow_frame(pkt, mac);
        }
        Ok(nb_rx)
    }

    fn slow_queue_member<'a>(&self, view: &'a BondView, port_id: u16) -> Result<(&'a MemberHandle, (u16, u16)), Fail> {
        let slow_queues: (u16, u16) = match view.slow_queues {
            Some(slow_queues) => slow_queues,
            None => {
                let cause: String = format!("bond {} has no dedicated queues", self.inner.name);
                error!("slow_queue_member(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        match view.member(port_id) {
            Some(member) => Ok((member, slow_queues)),
            None => {
                let cause: String = format!("port {} is not a member of {}", port_id, self.inner.name);
                error!("slow_queue_member(): {}", cause);
                Err(Fail::new(libc::ENODEV, &cause))
            },
        }
    }

    /// Sum of the counters of every member. Members whose counters cannot be read are skipped.
    pub fn stats(&self) -> Result<PortStats, Fail> {
        let cfg: RwLockReadGuard<BondConfig> = self.inner.read_config()?;
        let mut stats: PortStats = PortStats::default();
        for member in cfg.members.iter() {
            match member.port().stats() {
                Ok(member_stats) => stats += member_stats,
                Err(e) => warn!("stats(): cannot read counters of port {} ({:?})", member.port_id(), e),
            }
        }
        Ok(stats)
    }

    pub fn stats_reset(&self) -> Result<(), Fail> {
        let cfg: RwLockReadGuard<BondConfig> = self.inner.read_config()?;
        for member in cfg.members.iter() {
            member.port().stats_reset()?;
        }
        Ok(())
    }

    /// Capabilities of the bond: the most restrictive of its members.
    pub fn info(&self) -> Result<PortInfo, Fail> {
        let cfg: RwLockReadGuard<BondConfig> = self.inner.read_config()?;
        let mut info: PortInfo = PortInfo {
            max_rx_queues: MAX_QUEUES_PER_PORT,
            max_tx_queues: MAX_QUEUES_PER_PORT,
            max_rx_pktlen: MAX_JUMBO_FRAME_LEN,
            max_mac_addrs: BOND_MAX_MAC_ADDRS as u32,
        };
        if cfg.members.is_empty() {
            return Ok(info);
        }
        info.max_rx_queues = u16::MAX;
        info.max_tx_queues = u16::MAX;
        info.max_rx_pktlen = u32::MAX;
        for member in cfg.members.iter() {
            let member_info: PortInfo = member.port().info()?;
            info.max_rx_queues = info.max_rx_queues.min(member_info.max_rx_queues);
            info.max_tx_queues = info.max_tx_queues.min(member_info.max_tx_queues);
            info.max_rx_pktlen = info.max_rx_pktlen.min(member_info.max_rx_pktlen);
        }
        // One queue in each direction belongs to slow frames.
        if cfg.mode == BondingMode::Lacp && cfg.dedicated_queues {
            info.max_rx_queues = info.max_rx_queues.saturating_sub(1);
            info.max_tx_queues = info.max_tx_queues.saturating_sub(1);
        }
        Ok(info)
    }

    /// Sets the MTU of every member.
    pub fn set_mtu(&self, mtu: u16) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        for member in cfg.members.iter() {
            match member.port().set_mtu(mtu) {
                Ok(()) => (),
                Err(e) if e.errno == libc::ENOTSUP => debug!("set_mtu(): port {} keeps its MTU", member.port_id()),
                Err(e) => {
                    let cause: String = format!("cannot set MTU {} on port {} ({:?})", mtu, member.port_id(), e);
                    error!("set_mtu(): {}", cause);
                    return Err(Fail::new(e.errno, &cause));
                },
            }
        }
        cfg.mtu = mtu;
        Ok(())
    }

    pub fn mtu(&self) -> Result<u16, Fail> {
        Ok(self.inner.read_config()?.mtu)
    }
}

impl BondInner {
    fn start_locked(self: &Arc<Self>, cfg: &mut BondConfig) -> Result<(), Fail> {
        cfg.started = true;
        if !cfg.user_defined_mac {
            let persisted: Option<MacAddress> = cfg
                .primary_port
                .and_then(|id| cfg.member(id))
                .map(|member| member.persisted_mac());
            if let Some(mac) = persisted {
                cfg.mac_addrs[0] = mac;
            }
        }
        for member in cfg.members.iter() {
            member_start(cfg, member.port())?;
        }
        cfg.link_status_polling_enabled = cfg.members.iter().any(|m| m.link_status_poll_enabled());
        self.tlb.reset();
        if cfg.mode == BondingMode::Alb {
            self.alb.reset();
        }
        let cfg: &BondConfig = cfg;
        self.publish(cfg, &self.lock_link());

        // Links may have come up while the members were stopped.
        let port_ids: Vec<u16> = cfg.members.iter().map(|m| m.port_id()).collect();
        for port_id in port_ids {
            self.handle_lsc(cfg, port_id);
        }
        if cfg.link_status_polling_enabled {
            self.arm_monitor(cfg);
        }

        let mut link: MutexGuard<LinkState> = self.lock_link();
        self.mac_address_members_update(cfg, &link)?;
        if cfg.user_defined_primary {
            if let Some(primary) = cfg.primary_port {
                primary_set(&mut link, primary);
                self.sync_members(cfg, &link);
                self.link_update(cfg, &mut link);
            }
        }
        self.publish(cfg, &link);
        if cfg.mode.uses_tlb() {
            self.tlb.update(&self.view.load());
            drop(link);
            self.arm_tlb();
        }
        Ok(())
    }

    pub(crate) fn stop_locked(&self, cfg: &mut BondConfig) -> Result<(), Fail> {
        if !cfg.started {
            return Ok(());
        }
        if cfg.mode == BondingMode::Lacp {
            for member in cfg.members.iter() {
                member.handle().lacp.drain();
            }
        }
        let pending: Vec<Alarm> = {
            let mut alarms = self.lock_alarms();
            [alarms.monitor.take(), alarms.tlb.take(), alarms.lsc_delay.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for mut alarm in pending {
            alarm.cancel();
        }
        self.tlb.reset();

        cfg.started = false;
        cfg.link_status_polling_enabled = false;
        let cfg: &BondConfig = cfg;
        let mut link: MutexGuard<LinkState> = self.lock_link();
        link.link = LinkStatus::down();
        let mut result: Result<(), Fail> = Ok(());
        for member in cfg.members.iter() {
            member.set_last_link_status(false);
            if let Err(e) = member.port().stop() {
                warn!("stop_locked(): cannot stop port {} ({:?})", member.port_id(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
            if link.is_active(member.port_id()) {
                self.deactivate_member(cfg, &mut link, member.port_id());
            }
        }
        self.publish(cfg, &link);
        info!("stop(): bond {} stopped", self.name);
        result
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ensure_eq,
        runtime::network::{
            PhysicalPort,
            SoftPort,
        },
    };
    use ::anyhow::Result;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x02, 0, 0, 0, 0, last])
    }

    fn bond_with_members(mode: BondingMode, count: u16) -> Result<(BondDevice, Vec<Arc<SoftPort>>)> {
        let bond: BondDevice = BondDevice::new("net_bonding0", 100, mode);
        let mut ports: Vec<Arc<SoftPort>> = Vec::new();
        for port_id in 0..count {
            let port: Arc<SoftPort> = SoftPort::new(port_id, mac(port_id as u8 + 1), 10_000);
            bond.add_member(port.clone())?;
            ports.push(port);
        }
        Ok((bond, ports))
    }

    #[test]
    fn start_without_members_fails() -> Result<()> {
        let bond: BondDevice = BondDevice::new("net_bonding0", 100, BondingMode::RoundRobin);
        match bond.start() {
            Err(e) => ensure_eq!(e.errno, libc::EINVAL),
            Ok(()) => anyhow::bail!("start() should fail without members"),
        }
        ensure_eq!(bond.is_started(), false);
        Ok(())
    }

    #[test]
    fn start_activates_members_with_link() -> Result<()> {
        let (bond, ports) = bond_with_members(BondingMode::RoundRobin, 3)?;
        ports[1].set_link_down();
        bond.start()?;
        ensure_eq!(bond.is_started(), true);
        ensure_eq!(bond.active_members(), vec![0, 2]);
        ensure_eq!(bond.link().up, true);
        ensure_eq!(bond.link().speed_mbps, 20_000);
        for port in ports.iter() {
            ensure_eq!(port.is_started(), true);
            ensure_eq!(port.mac_addr(), mac(1));
        }
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let (bond, ports) = bond_with_members(BondingMode::ActiveBackup, 2)?;
        bond.start()?;
        bond.stop()?;
        bond.stop()?;
        ensure_eq!(bond.is_started(), false);
        ensure_eq!(bond.active_members().is_empty(), true);
        ensure_eq!(bond.link().up, false);
        ensure_eq!(ports[0].is_started(), false);
        ensure_eq!(bond.member_link_status(0)?, false);
        Ok(())
    }

    #[test]
    fn mode_change_requires_stopped_bond() -> Result<()> {
        let (bond, _ports) = bond_with_members(BondingMode::RoundRobin, 2)?;
        bond.start()?;
        match bond.set_mode(BondingMode::Broadcast) {
            Err(e) => ensure_eq!(e.errno, libc::EBUSY),
            Ok(()) => anyhow::bail!("set_mode() should fail on a running bond"),
        }
        bond.stop()?;
        bond.set_mode(BondingMode::Broadcast)?;
        ensure_eq!(bond.mode(), BondingMode::Broadcast);
        Ok(())
    }

    #[test]
    fn queue_handles_are_bounded() -> Result<()> {
        let (bond, _ports) = bond_with_members(BondingMode::RoundRobin, 1)?;
        bond.configure(2, 4)?;
        ensure_eq!(bond.rx_queue(1)?.queue_id(), 1);
        ensure_eq!(bond.tx_queue(3)?.queue_id(), 3);
        ensure_eq!(bond.rx_queue(2).is_err(), true);
        ensure_eq!(bond.configure(0, 1).map_err(|e| e.errno), Err(libc::EINVAL));
        Ok(())
    }

    #[test]
    fn dedicated_queues_reserve_one_queue_per_direction() -> Result<()> {
        let (bond, ports) = bond_with_members(BondingMode::Lacp, 2)?;
        ensure_eq!(bond.info()?.max_rx_queues, 16);
        bond.enable_dedicated_queues(true)?;
        ensure_eq!(bond.dedicated_queues(), true);
        ensure_eq!(bond.info()?.max_rx_queues, 15);
        bond.start()?;
        ensure_eq!(ports[0].queues(), (2, 2));
        ensure_eq!(bond.enable_dedicated_queues(false).map_err(|e| e.errno), Err(libc::EBUSY));
        Ok(())
    }

    #[test]
    fn dedicated_queues_need_lacp_mode() -> Result<()> {
        let (bond, _ports) = bond_with_members(BondingMode::Balance, 2)?;
        ensure_eq!(bond.enable_dedicated_queues(true).map_err(|e| e.errno), Err(libc::ENOTSUP));
        ensure_eq!(bond.flush_lacp_ctrl(0).map_err(|e| e.errno), Err(libc::EINVAL));
        Ok(())
    }

    #[test]
    fn stats_add_up_member_counters() -> Result<()> {
        let (bond, ports) = bond_with_members(BondingMode::RoundRobin, 2)?;
        bond.start()?;
        let txq: BondTxQueue = bond.tx_queue(0)?;
        let mut pkts: Vec<Mbuf> = (0..4).map(|_| Mbuf::from_slice(&[0u8; 64])).collect();
        ensure_eq!(txq.tx_burst(&mut pkts), 4);
        let stats: PortStats = bond.stats()?;
        ensure_eq!(stats.opackets, 4);
        ensure_eq!(stats.obytes, 256);
        ensure_eq!(ports[0].take_tx().len(), 2);
        bond.stats_reset()?;
        ensure_eq!(bond.stats()?.opackets, 0);
        Ok(())
    }

    #[test]
    fn close_restores_members() -> Result<()> {
        let (bond, ports) = bond_with_members(BondingMode::Balance, 2)?;
        bond.start()?;
        ensure_eq!(ports[1].mac_addr(), mac(1));
        bond.close()?;
        ensure_eq!(bond.members().is_empty(), true);
        ensure_eq!(ports[1].mac_addr(), mac(2));
        ensure_eq!(ports[1].is_started(), false);
        Ok(())
    }
}
