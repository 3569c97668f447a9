// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Link bonding: several member ports behind one logical port.
//!
//! Control-plane state lives behind two locks, taken in this order: the configuration lock (membership, mode,
//! addresses, lifecycle) and the link-status-change lock (active members, current primary, bond link). Every change
//! publishes an immutable [BondView] that burst calls read without locking.

//======================================================================================================================
// Exports
//======================================================================================================================

mod address;
mod alb;
pub mod config;
mod device;
pub mod hash;
pub mod lacp;
mod link;
mod member;
pub mod mode;
mod queue;
mod rx;
pub mod tlb;
mod tx;

pub use self::{
    lacp::{
        ActorState,
        LacpPort,
    },
    mode::{
        BondingMode,
        XmitPolicy,
    },
    queue::{
        BondRxQueue,
        BondTxQueue,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    alb::Alb,
    mode::BurstOps,
    tlb::TlbState,
};
use crate::runtime::{
    fail::Fail,
    memory::MbufPool,
    network::{
        consts::{
            DEFAULT_MTU,
            MAX_PORTS,
        },
        types::MacAddress,
        LinkStatus,
        SharedPort,
    },
    timer::Alarm,
};
use ::arc_swap::ArcSwap;
use ::arrayvec::ArrayVec;
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Maximum number of members of a bond.
pub const BOND_MAX_MEMBERS: usize = MAX_PORTS;

/// Number of MAC address slots of a bond. Slot 0 holds the default address.
pub const BOND_MAX_MAC_ADDRS: usize = 16;

/// Default period of the link polling monitor.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(10);

/// Number of buffers reserved for ALB refresh packets.
const ALB_POOL_SIZE: usize = 512;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Link event callback. Invoked with the bond port identifier and the new bond link status.
pub type LinkEventCallback = Arc<dyn Fn(u16, LinkStatus) + Send + Sync>;

/// Member port handle as seen by the data path.
#[derive(Clone)]
pub(crate) struct MemberHandle {
    pub port_id: u16,
    pub port: SharedPort,
    pub lacp: Arc<LacpPort>,
}

/// Per-member bookkeeping.
pub struct MemberRecord {
    port_id: u16,
    /// Link status observed by the last link-status-change evaluation.
    last_link_status: AtomicBool,
    /// The member raises no link-status-change interrupts and is polled instead.
    link_status_poll_enabled: bool,
    /// Default MAC address of the port before it joined the bond.
    persisted_mac: MacAddress,
    handle: MemberHandle,
    lsc_token: Option<u64>,
}

/// Configuration of a bond. Guarded by the configuration lock.
pub(crate) struct BondConfig {
    pub mode: BondingMode,
    pub policy: XmitPolicy,
    pub dedicated_queues: bool,
    pub members: Vec<MemberRecord>,
    /// Configured primary. Falls back to the first member.
    pub primary_port: Option<u16>,
    pub user_defined_primary: bool,
    pub mac_addrs: [MacAddress; BOND_MAX_MAC_ADDRS],
    pub user_defined_mac: bool,
    pub link_up_delay: Duration,
    pub link_down_delay: Duration,
    pub polling_interval: Duration,
    pub link_status_polling_enabled: bool,
    pub started: bool,
    pub promiscuous: bool,
    pub allmulticast: bool,
    pub mtu: u16,
    pub nb_rx_queues: u16,
    pub nb_tx_queues: u16,
}

/// Liveness state. Guarded by the link-status-change lock.
pub(crate) struct LinkState {
    /// Active members, in activation order.
    pub active: ArrayVec<u16, BOND_MAX_MEMBERS>,
    pub current_primary: Option<u16>,
    pub link: LinkStatus,
    /// Link properties every member must share in 802.3ad mode.
    pub lacp_link: LinkStatus,
}

/// Immutable snapshot of everything the burst functions read.
pub(crate) struct BondView {
    pub mode: BondingMode,
    pub burst: BurstOps,
    pub policy: XmitPolicy,
    pub members: Vec<MemberHandle>,
    pub active: Vec<MemberHandle>,
    pub primary: Option<MemberHandle>,
    pub configured_primary: Option<MemberHandle>,
    /// Bond MAC addresses in use, default address first.
    pub mac_addrs: Vec<MacAddress>,
    pub promiscuous: bool,
    pub allmulticast: bool,
    pub link: LinkStatus,
    pub started: bool,
    /// Receive and transmit queues reserved for slow frames when dedicated queues are enabled.
    pub slow_queues: Option<(u16, u16)>,
}

#[derive(Default)]
pub(crate) struct Alarms {
    pub monitor: Option<Alarm>,
    pub tlb: Option<Alarm>,
    pub lsc_delay: Option<Alarm>,
}

#[derive(Default)]
pub(crate) struct EventRegistry {
    pub next_token: u64,
    pub callbacks: Vec<(u64, LinkEventCallback)>,
}

pub(crate) struct BondInner {
    pub name: String,
    pub port_id: u16,
    pub config: RwLock<BondConfig>,
    pub link: Mutex<LinkState>,
    pub view: ArcSwap<BondView>,
    pub tlb: TlbState,
    pub alb: Alb,
    pub alarms: Mutex<Alarms>,
    pub events: Mutex<EventRegistry>,
}

/// A bonded port.
#[derive(Clone)]
pub struct BondDevice {
    inner: Arc<BondInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl MemberHandle {
    pub fn mac_addr(&self) -> MacAddress {
        self.port.mac_addr()
    }
}

impl MemberRecord {
    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    pub fn last_link_status(&self) -> bool {
        self.last_link_status.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_link_status(&self, up: bool) {
        self.last_link_status.store(up, Ordering::Release);
    }

    pub fn link_status_poll_enabled(&self) -> bool {
        self.link_status_poll_enabled
    }

    pub fn persisted_mac(&self) -> MacAddress {
        self.persisted_mac
    }

    pub(crate) fn handle(&self) -> &MemberHandle {
        &self.handle
    }

    pub(crate) fn port(&self) -> &SharedPort {
        &self.handle.port
    }
}

impl BondConfig {
    fn new(mode: BondingMode) -> Self {
        Self {
            mode,
            policy: XmitPolicy::default(),
            dedicated_queues: false,
            members: Vec::new(),
            primary_port: None,
            user_defined_primary: false,
            mac_addrs: [MacAddress::nil(); BOND_MAX_MAC_ADDRS],
            user_defined_mac: false,
            link_up_delay: Duration::ZERO,
            link_down_delay: Duration::ZERO,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            link_status_polling_enabled: false,
            started: false,
            promiscuous: false,
            allmulticast: false,
            mtu: DEFAULT_MTU,
            nb_rx_queues: 1,
            nb_tx_queues: 1,
        }
    }

    pub fn member(&self, port_id: u16) -> Option<&MemberRecord> {
        self.members.iter().find(|m| m.port_id == port_id)
    }

    pub fn member_position(&self, port_id: u16) -> Option<usize> {
        self.members.iter().position(|m| m.port_id == port_id)
    }

    pub fn handle(&self, port_id: u16) -> Option<MemberHandle> {
        self.member(port_id).map(|m| m.handle.clone())
    }

    /// Queues each member is configured with.
    pub fn member_queues(&self) -> (u16, u16) {
        if self.mode == BondingMode::Lacp && self.dedicated_queues {
            (self.nb_rx_queues + 1, self.nb_tx_queues + 1)
        } else {
            (self.nb_rx_queues, self.nb_tx_queues)
        }
    }
}

impl LinkState {
    fn new() -> Self {
        Self {
            active: ArrayVec::new(),
            current_primary: None,
            link: LinkStatus::down(),
            lacp_link: LinkStatus::down(),
        }
    }

    pub fn is_active(&self, port_id: u16) -> bool {
        self.active.contains(&port_id)
    }
}

impl BondView {
    pub fn member(&self, port_id: u16) -> Option<&MemberHandle> {
        self.members.iter().find(|m| m.port_id == port_id)
    }

    /// Returns `true` if `mac` is one of the bond addresses.
    pub fn is_bond_mac(&self, mac: MacAddress) -> bool {
        self.mac_addrs.contains(&mac)
    }
}

impl BondInner {
    pub fn read_config(&self) -> Result<RwLockReadGuard<BondConfig>, Fail> {
        Ok(self.config.read()?)
    }

    pub fn write_config(&self) -> Result<RwLockWriteGuard<BondConfig>, Fail> {
        Ok(self.config.write()?)
    }

    /// Takes the link-status-change lock. Liveness state stays usable if a holder panicked.
    pub fn lock_link(&self) -> MutexGuard<LinkState> {
        match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn lock_alarms(&self) -> MutexGuard<Alarms> {
        match self.alarms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Publishes a new snapshot for the data path.
    pub fn publish(&self, cfg: &BondConfig, link: &LinkState) {
        let view: BondView = BondView {
            mode: cfg.mode,
            burst: BurstOps::select(cfg.mode, cfg.dedicated_queues),
            policy: cfg.policy,
            members: cfg.members.iter().map(|m| m.handle.clone()).collect(),
            active: link.active.iter().filter_map(|id| cfg.handle(*id)).collect(),
            primary: link.current_primary.and_then(|id| cfg.handle(id)),
            configured_primary: cfg.primary_port.and_then(|id| cfg.handle(id)),
            mac_addrs: cfg.mac_addrs.iter().filter(|mac| !mac.is_nil()).copied().collect(),
            promiscuous: cfg.promiscuous,
            allmulticast: cfg.allmulticast,
            link: link.link,
            started: cfg.started,
            slow_queues: if cfg.mode == BondingMode::Lacp && cfg.dedicated_queues {
                Some((cfg.nb_rx_queues, cfg.nb_tx_queues))
            } else {
                None
            },
        };
        self.view.store(Arc::new(view));
    }
}

impl BondDevice {
    /// Creates a bond with no members.
    pub fn new(name: &str, port_id: u16, mode: BondingMode) -> Self {
        let cfg: BondConfig = BondConfig::new(mode);
        let link: LinkState = LinkState::new();
        let inner: BondInner = BondInner {
            name: name.to_string(),
            port_id,
            view: ArcSwap::from_pointee(BondView {
                mode,
                burst: BurstOps::select(mode, false),
                policy: cfg.policy,
                members: Vec::new(),
                active: Vec::new(),
                primary: None,
                configured_primary: None,
                mac_addrs: Vec::new(),
                promiscuous: false,
                allmulticast: false,
                link: link.link,
                started: false,
                slow_queues: None,
            }),
            config: RwLock::new(cfg),
            link: Mutex::new(link),
            tlb: TlbState::new(),
            alb: Alb::new(MbufPool::new(&format!("{}_alb", name), ALB_POOL_SIZE)),
            alarms: Mutex::new(Alarms::default()),
            events: Mutex::new(EventRegistry::default()),
        };
        info!("new(): bond {} created (port_id={}, mode={})", name, port_id, mode);
        Self { inner: Arc::new(inner) }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn port_id(&self) -> u16 {
        self.inner.port_id
    }

    pub fn mode(&self) -> BondingMode {
        self.inner.view.load().mode
    }

    pub fn xmit_policy(&self) -> XmitPolicy {
        self.inner.view.load().policy
    }

    /// Identifiers of all members, in list order.
    pub fn members(&self) -> Vec<u16> {
        self.inner.view.load().members.iter().map(|m| m.port_id).collect()
    }

    /// Identifiers of the active members, in activation order.
    pub fn active_members(&self) -> Vec<u16> {
        self.inner.view.load().active.iter().map(|m| m.port_id).collect()
    }

    /// Current primary member.
    pub fn primary(&self) -> Option<u16> {
        self.inner.view.load().primary.as_ref().map(|m| m.port_id)
    }

    /// Bond link status.
    pub fn link(&self) -> LinkStatus {
        self.inner.view.load().link
    }

    pub fn is_started(&self) -> bool {
        self.inner.view.load().started
    }

    /// Link status each member had when it was last evaluated.
    pub fn member_link_status(&self, port_id: u16) -> Result<bool, Fail> {
        let cfg: RwLockReadGuard<BondConfig> = self.inner.read_config()?;
        match cfg.member(port_id) {
            Some(member) => Ok(member.last_link_status()),
            None => {
                let cause: String = format!("port {} is not a member of {}", port_id, self.inner.name);
                error!("member_link_status(): {}", cause);
                Err(Fail::new(libc::ENODEV, &cause))
            },
        }
    }

    /// 802.3ad state of a member.
    pub fn lacp_port(&self, port_id: u16) -> Option<Arc<LacpPort>> {
        self.inner.view.load().member(port_id).map(|m| m.lacp.clone())
    }

    pub(crate) fn inner(&self) -> &Arc<BondInner> {
        &self.inner
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Clone for MemberRecord {
    fn clone(&self) -> Self {
        Self {
            port_id: self.port_id,
            last_link_status: AtomicBool::new(self.last_link_status()),
            link_status_poll_enabled: self.link_status_poll_enabled,
            persisted_mac: self.persisted_mac,
            handle: self.handle.clone(),
            lsc_token: self.lsc_token,
        }
    }
}

impl fmt::Debug for MemberRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberRecord")
            .field("port_id", &self.port_id)
            .field("last_link_status", &self.last_link_status())
            .field("link_status_poll_enabled", &self.link_status_poll_enabled)
            .field("persisted_mac", &self.persisted_mac)
            .finish()
    }
}

/// Dumps the bond in the style of a device inspection command.
impl fmt::Display for BondDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view: arc_swap::Guard<Arc<BondView>> = self.inner.view.load();
        let members: Vec<u16> = view.members.iter().map(|m| m.port_id).collect();
        let active: Vec<u16> = view.active.iter().map(|m| m.port_id).collect();
        writeln!(f, "Bond {} (port {}):", self.inner.name, self.inner.port_id)?;
        writeln!(f, "\tmode: {}", view.mode)?;
        if matches!(view.mode, BondingMode::Balance | BondingMode::Lacp) {
            writeln!(f, "\tbalance_xmit_policy: {}", view.policy)?;
        }
        write!(f, "\tMembers ({}): ", members.len())?;
        write_ids(f, &members)?;
        writeln!(f)?;
        write!(f, "\tActive members ({}): ", active.len())?;
        write_ids(f, &active)?;
        writeln!(f)?;
        match view.primary {
            Some(ref primary) => writeln!(f, "\tCurrent primary port: {}", primary.port_id)?,
            None => writeln!(f, "\tCurrent primary port: none")?,
        }
        match view.mac_addrs.first() {
            Some(mac) => writeln!(f, "\tMAC address: {}", mac)?,
            None => writeln!(f, "\tMAC address: none")?,
        }
        write!(f, "\tLink: {}", view.link)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn write_ids(f: &mut fmt::Formatter<'_>, ids: &[u16]) -> fmt::Result {
    write!(f, "[")?;
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}", id)?;
    }
    write!(f, "]")
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ensure_eq,
        runtime::network::SoftPort,
    };
    use ::anyhow::Result;

    #[test]
    fn new_bond_defaults() -> Result<()> {
        let bond: BondDevice = BondDevice::new("net_bonding0", 100, BondingMode::ActiveBackup);
        ensure_eq!(bond.mode(), BondingMode::ActiveBackup);
        ensure_eq!(bond.xmit_policy(), XmitPolicy::Layer2);
        ensure_eq!(bond.members().is_empty(), true);
        ensure_eq!(bond.primary(), None);
        ensure_eq!(bond.link().up, false);
        ensure_eq!(bond.is_started(), false);
        ensure_eq!(bond.inner.read_config()?.polling_interval, DEFAULT_POLLING_INTERVAL);
        Ok(())
    }

    #[test]
    fn dump_lists_members() -> Result<()> {
        let bond: BondDevice = BondDevice::new("net_bonding0", 100, BondingMode::Balance);
        for port_id in 0..3u16 {
            bond.add_member(SoftPort::new(port_id, MacAddress::new([2, 0, 0, 0, 0, port_id as u8 + 1]), 10_000))?;
        }
        let dump: String = bond.to_string();
        ensure_eq!(dump.contains("mode: BALANCE"), true);
        ensure_eq!(dump.contains("balance_xmit_policy: l2"), true);
        ensure_eq!(dump.contains("Members (3): [0 1 2]"), true);
        ensure_eq!(dump.contains("Active members (0): []"), true);
        Ok(())
    }
}
