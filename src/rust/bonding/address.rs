// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! MAC addresses and receive filters of a bond and their propagation to members.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        link::primary_set,
        BondConfig,
        BondDevice,
        BondInner,
        BondingMode,
        LinkState,
        MemberRecord,
        BOND_MAX_MAC_ADDRS,
    },
    runtime::{
        fail::Fail,
        network::{
            types::MacAddress,
            PhysicalPort,
        },
    },
};
use ::std::sync::{
    MutexGuard,
    RwLockWriteGuard,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Receive filter flags that follow the bond.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RxFilter {
    Promiscuous,
    AllMulticast,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RxFilter {
    fn apply(&self, port: &dyn PhysicalPort, enable: bool) -> Result<(), Fail> {
        match (self, enable) {
            (RxFilter::Promiscuous, true) => port.promiscuous_enable(),
            (RxFilter::Promiscuous, false) => port.promiscuous_disable(),
            (RxFilter::AllMulticast, true) => port.allmulticast_enable(),
            (RxFilter::AllMulticast, false) => port.allmulticast_disable(),
        }
    }

    fn get(&self, cfg: &BondConfig) -> bool {
        match self {
            RxFilter::Promiscuous => cfg.promiscuous,
            RxFilter::AllMulticast => cfg.allmulticast,
        }
    }

    fn set(&self, cfg: &mut BondConfig, enable: bool) {
        match self {
            RxFilter::Promiscuous => cfg.promiscuous = enable,
            RxFilter::AllMulticast => cfg.allmulticast = enable,
        }
    }
}

impl BondInner {
    /// Pushes the bond MAC address and receive filters to members after a change of primary.
    pub(crate) fn sync_members(&self, cfg: &BondConfig, link: &LinkState) {
        if let Err(e) = self.mac_address_members_update(cfg, link) {
            warn!("sync_members(): {:?}", e);
        }
        self.rx_filter_update(cfg, link, RxFilter::Promiscuous);
        self.rx_filter_update(cfg, link, RxFilter::AllMulticast);
    }

    /// Sets the default MAC address of each member as the mode requires.
    pub(crate) fn mac_address_members_update(&self, cfg: &BondConfig, link: &LinkState) -> Result<(), Fail> {
        if cfg.members.is_empty() {
            let cause: String = format!("bond {} has no members", self.name);
            debug!("mac_address_members_update(): {}", cause);
            return Err(Fail::new(libc::ENODEV, &cause));
        }
        let bond_mac: MacAddress = cfg.mac_addrs[0];
        match cfg.mode {
            // All members answer to the bond address.
            BondingMode::RoundRobin | BondingMode::Balance | BondingMode::Broadcast => {
                for member in cfg.members.iter() {
                    if let Err(e) = member.port().set_default_mac_addr(bond_mac) {
                        let cause: String = format!("cannot set MAC address of port {} ({:?})", member.port_id(), e);
                        error!("mac_address_members_update(): {}", cause);
                        return Err(Fail::new(e.errno, &cause));
                    }
                }
            },
            // Members keep their own address, which identifies them to the partner.
            BondingMode::Lacp => {
                for port_id in link.active.iter() {
                    if let Some(member) = cfg.member(*port_id) {
                        let lacp = &member.handle().lacp;
                        let member_mac: MacAddress = member.port().mac_addr();
                        if lacp.actor_system() != member_mac {
                            lacp.set_actor_system(member_mac);
                        }
                    }
                }
            },
            // Only the primary answers to the bond address.
            BondingMode::ActiveBackup | BondingMode::Tlb | BondingMode::Alb => {
                for member in cfg.members.iter() {
                    if Some(member.port_id()) == link.current_primary {
                        if let Err(e) = member.port().set_default_mac_addr(bond_mac) {
                            let cause: String =
                                format!("cannot set MAC address of primary port {} ({:?})", member.port_id(), e);
                            error!("mac_address_members_update(): {}", cause);
                            return Err(Fail::new(e.errno, &cause));
                        }
                    } else if let Err(e) = member.port().set_default_mac_addr(member.persisted_mac()) {
                        warn!(
                            "mac_address_members_update(): cannot restore MAC address of port {} ({:?})",
                            member.port_id(),
                            e
                        );
                    }
                }
            },
        }
        Ok(())
    }

    /// Applies a receive filter flag of the bond to the members. Returns an error if no member took it.
    fn rx_filter_apply(&self, cfg: &BondConfig, link: &LinkState, filter: RxFilter, enable: bool) -> Result<(), Fail> {
        if cfg.mode.propagates_to_all_members() {
            let mut last_error: Option<Fail> = None;
            let mut member_ok: usize = 0;
            for member in cfg.members.iter() {
                match filter.apply(member.port().as_ref(), enable) {
                    Ok(()) => member_ok += 1,
                    Err(e) => {
                        warn!("rx_filter_apply(): {:?} on port {} failed ({:?})", filter, member.port_id(), e);
                        last_error = Some(e);
                    },
                }
            }
            match last_error {
                Some(e) if member_ok == 0 => Err(e),
                _ => Ok(()),
            }
        } else {
            // Without members there is no primary to configure.
            if cfg.members.is_empty() {
                return Ok(());
            }
            match link.current_primary.and_then(|port_id| cfg.member(port_id)) {
                Some(primary) => filter.apply(primary.port().as_ref(), enable),
                None => Ok(()),
            }
        }
    }

    /// Moves a receive filter flag to a new primary in the modes where only the primary carries it.
    fn rx_filter_update(&self, cfg: &BondConfig, link: &LinkState, filter: RxFilter) {
        if cfg.mode.propagates_to_all_members() {
            return;
        }
        if let Some(primary) = link.current_primary.and_then(|port_id| cfg.member(port_id)) {
            if let Err(e) = filter.apply(primary.port().as_ref(), filter.get(cfg)) {
                warn!("rx_filter_update(): {:?} on port {} failed ({:?})", filter, primary.port_id(), e);
            }
        }
    }

    /// Installs the secondary bond addresses on a member. On failure the addresses installed so far are removed.
    pub(crate) fn member_add_mac_addresses(&self, cfg: &BondConfig, member: &MemberRecord) -> Result<(), Fail> {
        let secondary: Vec<MacAddress> = cfg.mac_addrs[1..].iter().filter(|mac| !mac.is_nil()).copied().collect();
        for (i, mac) in secondary.iter().enumerate() {
            if let Err(e) = member.port().mac_addr_add(*mac) {
                error!("member_add_mac_addresses(): cannot add {} to port {} ({:?})", mac, member.port_id(), e);
                for installed in secondary[..i].iter().rev() {
                    if let Err(e) = member.port().mac_addr_remove(*installed) {
                        warn!(
                            "member_add_mac_addresses(): cannot roll back {} on port {} ({:?})",
                            installed,
                            member.port_id(),
                            e
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes the secondary bond addresses from a member.
    pub(crate) fn member_remove_mac_addresses(&self, cfg: &BondConfig, member: &MemberRecord) {
        for mac in cfg.mac_addrs[1..].iter().filter(|mac| !mac.is_nil()) {
            if let Err(e) = member.port().mac_addr_remove(*mac) {
                debug!("member_remove_mac_addresses(): port {} ({:?})", member.port_id(), e);
            }
        }
    }
}

impl BondDevice {
    /// Default MAC address of the bond. Nil until the first member joins, unless set by the user.
    pub fn mac_addr(&self) -> MacAddress {
        self.inner.view.load().mac_addrs.first().copied().unwrap_or_else(MacAddress::nil)
    }

    /// All MAC addresses of the bond, default address first.
    pub fn mac_addrs(&self) -> Vec<MacAddress> {
        self.inner.view.load().mac_addrs.clone()
    }

    /// Sets the default MAC address of the bond. The address sticks across membership changes.
    pub fn set_mac_addr(&self, mac: MacAddress) -> Result<(), Fail> {
        if mac.is_nil() || mac.is_multicast() {
            let cause: String = format!("invalid MAC address {}", mac);
            error!("set_mac_addr(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        cfg.mac_addrs[0] = mac;
        cfg.user_defined_mac = true;
        let result: Result<(), Fail> = if cfg.members.is_empty() {
            Ok(())
        } else {
            self.inner.mac_address_members_update(&cfg, &link)
        };
        self.inner.publish(&cfg, &link);
        result
    }

    /// Drops a user-defined MAC address and goes back to the address of the configured primary.
    pub fn reset_mac_addr(&self) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        cfg.user_defined_mac = false;
        let persisted: Option<MacAddress> = cfg
            .primary_port
            .and_then(|port_id| cfg.member(port_id))
            .map(|primary| primary.persisted_mac());
        let result: Result<(), Fail> = match persisted {
            Some(mac) => {
                cfg.mac_addrs[0] = mac;
                self.inner.mac_address_members_update(&cfg, &link)
            },
            None => Ok(()),
        };
        self.inner.publish(&cfg, &link);
        result
    }

    /// Adds a secondary MAC address to the bond and to every member. Members that took the address give it back if
    /// another one fails.
    pub fn mac_addr_add(&self, mac: MacAddress) -> Result<(), Fail> {
        if mac.is_nil() {
            let cause: String = format!("invalid MAC address {}", mac);
            error!("mac_addr_add(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        if cfg.mac_addrs.contains(&mac) {
            return Ok(());
        }
        let slot: usize = match (1..BOND_MAX_MAC_ADDRS).find(|i| cfg.mac_addrs[*i].is_nil()) {
            Some(slot) => slot,
            None => {
                let cause: String = format!("no room for MAC address {} on {}", mac, self.inner.name);
                error!("mac_addr_add(): {}", cause);
                return Err(Fail::new(libc::ENOSPC, &cause));
            },
        };
        for (i, member) in cfg.members.iter().enumerate() {
            if let Err(e) = member.port().mac_addr_add(mac) {
                error!("mac_addr_add(): cannot add {} to port {} ({:?})", mac, member.port_id(), e);
                for added in cfg.members[..i].iter().rev() {
                    if let Err(e) = added.port().mac_addr_remove(mac) {
                        warn!(
                            "mac_addr_add(): cannot roll back {} on port {} ({:?})",
                            mac,
                            added.port_id(),
                            e
                        );
                    }
                }
                return Err(e);
            }
        }
        cfg.mac_addrs[slot] = mac;
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        self.inner.publish(&cfg, &link);
        Ok(())
    }

    /// Removes a secondary MAC address from the bond and its members. The default address cannot be removed.
    pub fn mac_addr_remove(&self, mac: MacAddress) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        let slot: usize = match cfg.mac_addrs.iter().position(|m| *m == mac && !m.is_nil()) {
            Some(0) => {
                let cause: String = format!("cannot remove default MAC address {}", mac);
                error!("mac_addr_remove(): {}", cause);
                return Err(Fail::new(libc::EADDRINUSE, &cause));
            },
            Some(slot) => slot,
            None => return Ok(()),
        };
        for member in cfg.members.iter() {
            if let Err(e) = member.port().mac_addr_remove(mac) {
                debug!("mac_addr_remove(): port {} ({:?})", member.port_id(), e);
            }
        }
        cfg.mac_addrs[slot] = MacAddress::nil();
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        self.inner.publish(&cfg, &link);
        Ok(())
    }

    fn set_rx_filter(&self, filter: RxFilter, enable: bool) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        let link: MutexGuard<LinkState> = self.inner.lock_link();
        self.inner.rx_filter_apply(&cfg, &link, filter, enable)?;
        filter.set(&mut cfg, enable);
        self.inner.publish(&cfg, &link);
        Ok(())
    }

    pub fn promiscuous_enable(&self) -> Result<(), Fail> {
        self.set_rx_filter(RxFilter::Promiscuous, true)
    }

    pub fn promiscuous_disable(&self) -> Result<(), Fail> {
        self.set_rx_filter(RxFilter::Promiscuous, false)
    }

    pub fn promiscuous_get(&self) -> bool {
        self.inner.view.load().promiscuous
    }

    pub fn allmulticast_enable(&self) -> Result<(), Fail> {
        self.set_rx_filter(RxFilter::AllMulticast, true)
    }

    pub fn allmulticast_disable(&self) -> Result<(), Fail> {
        self.set_rx_filter(RxFilter::AllMulticast, false)
    }

    pub fn allmulticast_get(&self) -> bool {
        self.inner.view.load().allmulticast
    }

    /// Makes `port_id` the preferred primary. It becomes the current primary right away if it is active, or if no
    /// member is.
    pub fn set_primary(&self, port_id: u16) -> Result<(), Fail> {
        let mut cfg: RwLockWriteGuard<BondConfig> = self.inner.write_config()?;
        if cfg.member(port_id).is_none() {
            let cause: String = format!("port {} is not a member of {}", port_id, self.inner.name);
            error!("set_primary(): {}", cause);
            return Err(Fail::new(libc::ENODEV, &cause));
        }
        cfg.user_defined_primary = true;
        cfg.primary_port = Some(port_id);
        let mut link: MutexGuard<LinkState> = self.inner.lock_link();
        let previous: Option<u16> = link.current_primary;
        primary_set(&mut link, port_id);
        if link.current_primary != previous {
            self.inner.sync_members(&cfg, &link);
            self.inner.link_update(&cfg, &mut link);
        }
        self.inner.publish(&cfg, &link);
        Ok(())
    }

    /// Preferred primary, as configured.
    pub fn configured_primary(&self) -> Option<u16> {
        self.inner.view.load().configured_primary.as_ref().map(|m| m.port_id)
    }
}
