// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        BondConfig,
        BondDevice,
        BondInner,
        LacpPort,
        LinkState,
        MemberHandle,
        MemberRecord,
        BOND_MAX_MEMBERS,
    },
    runtime::{
        fail::Fail,
        network::{
            types::MacAddress,
            LinkStatus,
            LscCallback,
            PortInfo,
            SharedPort,
        },
    },
};
use ::std::sync::{
    atomic::AtomicBool,
    Arc,
    MutexGuard,
    RwLockReadGuard,
    RwLockWriteGuard,
    Weak,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Ethernet header, one VLAN tag and the frame check sequence.
const ETHER_OVERHEAD: u32 = 14 + 4 + 4;

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl BondDevice {
    /// Adds a port to the bond. If the bond is running, the port is configured, started and evaluated right away.
    pub fn add_member(&self, port: SharedPort) -> Result<(), Fail> {
        let port_id: u16 = port.port_id();
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        if port_id == self.inner.port_id {
            let cause: String = format!("bond {} cannot be a member of itself", self.inner.name);
            error!("add_member(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if cfg.member(port_id).is_some() {
            let cause: String = format!("port {} is already a member of {}", port_id, self.inner.name);
            error!("add_member(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        if cfg.members.len() >= BOND_MAX_MEMBERS {
            let cause: String = format!("bond {} is full (members={})", self.inner.name, cfg.members.len());
            error!("add_member(): {}", cause);
            return Err(Fail::new(libc::ENOSPC, &cause));
        }
        let info: PortInfo = port.info()?;
        if info.max_rx_pktlen < cfg.mtu as u32 + ETHER_OVERHEAD {
            let cause: String = format!(
                "port {} cannot receive {} byte frames (max_rx_pktlen={})",
                port_id,
                cfg.mtu as u32 + ETHER_OVERHEAD,
                info.max_rx_pktlen
            );
            error!("add_member(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        // Members that cannot raise link-status-change interrupts are polled.
        let mut lsc_token: Option<u64> = None;
        if port.supports_lsc_interrupt() {
            let weak: Weak<BondInner> = Arc::downgrade(&self.inner);
            let callback: LscCallback = Arc::new(move |port_id: u16| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_member_lsc(port_id);
                }
            });
            match port.register_lsc_callback(callback) {
                Ok(token) => lsc_token = Some(token),
                Err(e) => warn!("add_member(): port {} will be polled ({:?})", port_id, e),
            }
        }
        let record: MemberRecord = MemberRecord {
            port_id,
            last_link_status: AtomicBool::new(false),
            link_status_poll_enabled: lsc_token.is_none(),
            persisted_mac: port.mac_addr(),
            handle: MemberHandle {
                port_id,
                port: port.clone(),
                lacp: Arc::new(LacpPort::new(port_id)),
            },
            lsc_token,
        };

        if let Err(e) = self.inner.member_add_mac_addresses(&cfg, &record) {
            unregister_lsc(&record);
            return Err(e);
        }
        if cfg.members.is_empty() {
            if !cfg.user_defined_mac {
                cfg.mac_addrs[0] = record.persisted_mac;
            }
            cfg.primary_port = Some(port_id);
            self.inner.lock_link().current_primary = Some(port_id);
        }
        cfg.members.push(record);

        if cfg.started {
            if let Err(e) = member_start(&cfg, &port) {
                error!("add_member(): cannot start port {} ({:?})", port_id, e);
                if let Some(record) = cfg.members.pop() {
                    self.inner.member_remove_mac_addresses(&cfg, &record);
                    unregister_lsc(&record);
                }
                if cfg.members.is_empty() {
                    cfg.primary_port = None;
                    self.inner.lock_link().current_primary = None;
                }
                return Err(e);
            }
            self.inner.handle_lsc(&cfg, port_id);
            if lsc_token.is_none() {
                cfg.link_status_polling_enabled = true;
                self.inner.arm_monitor(&cfg);
            }
        }

        let link: MutexGuard<LinkState> = self.inner.lock_link();
        if let Err(e) = self.inner.mac_address_members_update(&cfg, &link) {
            warn!("add_member(): {:?}", e);
        }
        self.inner.publish(&cfg, &link);
        info!("add_member(): port {} joined {}", port_id, self.inner.name);
        Ok(())
    }

    /// Removes a port from the bond and gives it back its original MAC address.
    pub fn remove_member(&self, port_id: u16) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        self.inner.remove_member_locked(&mut cfg, port_id)
    }

    /// Snapshot of the member records, in list order.
    pub fn member_records(&self) -> Result<Vec<MemberRecord>, Fail> {
        let cfg: RwLockReadGuard<BondConfig> = self.inner.read_config()?;
        Ok(cfg.members.to_vec())
    }
}

impl BondInner {
    pub(crate) fn remove_member_locked(self: &Arc<Self>, cfg: &mut BondConfig, port_id: u16) -> Result<(), Fail> {
        let position: usize = match cfg.member_position(port_id) {
            Some(position) => position,
            None => {
                let cause: String = format!("port {} is not a member of {}", port_id, self.name);
                error!("remove_member(): {}", cause);
                return Err(Fail::new(libc::ENODEV, &cause));
            },
        };
        let mut link: MutexGuard<LinkState> = self.lock_link();
        let was_up: bool = link.link.up;
        if link.is_active(port_id) {
            self.deactivate_member(cfg, &mut link, port_id);
        }

        let record: MemberRecord = cfg.members.remove(position);
        unregister_lsc(&record);
        if let Err(e) = record.port().set_default_mac_addr(record.persisted_mac) {
            warn!("remove_member(): cannot restore MAC address of port {} ({:?})", port_id, e);
        }
        self.member_remove_mac_addresses(cfg, &record);

        if link.current_primary == Some(port_id) {
            link.current_primary = match link.active.first() {
                Some(first) => Some(*first),
                None => cfg.members.first().map(|m| m.port_id),
            };
            if !cfg.members.is_empty() {
                if let Err(e) = self.mac_address_members_update(cfg, &link) {
                    warn!("remove_member(): {:?}", e);
                }
            }
        }
        if cfg.primary_port == Some(port_id) {
            cfg.primary_port = match link.current_primary {
                Some(current) => Some(current),
                None => cfg.members.first().map(|m| m.port_id),
            };
            cfg.user_defined_primary = false;
        }
        if cfg.members.is_empty() && !cfg.user_defined_mac {
            cfg.mac_addrs[0] = MacAddress::nil();
        }

        self.link_update(cfg, &mut link);
        self.publish(cfg, &link);
        if was_up && !link.link.up {
            self.notify_link(cfg, link.link);
        }
        info!("remove_member(): port {} left {}", port_id, self.name);
        Ok(())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Brings a member up with the queue layout and MTU of the bond.
pub(crate) fn member_start(cfg: &BondConfig, port: &SharedPort) -> Result<(), Fail> {
    let (nb_rx_queues, nb_tx_queues): (u16, u16) = cfg.member_queues();
    port.stop()?;
    port.configure(nb_rx_queues, nb_tx_queues)?;
    match port.set_mtu(cfg.mtu) {
        Ok(()) => (),
        Err(e) if e.errno == libc::ENOTSUP => debug!("member_start(): port {} keeps its MTU", port.port_id()),
        Err(e) => return Err(e),
    }
    port.start()?;
    let status: LinkStatus = port.link_get_nowait().unwrap_or_else(|_| LinkStatus::down());
    debug!("member_start(): port {} started (link {})", port.port_id(), status);
    Ok(())
}

fn unregister_lsc(record: &MemberRecord) {
    if let Some(token) = record.lsc_token {
        if let Err(e) = record.port().unregister_lsc_callback(token) {
            warn!("unregister_lsc(): port {} ({:?})", record.port_id, e);
        }
    }
}
