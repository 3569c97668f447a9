// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    bonding::{
        BondDevice,
        BondingMode,
        XmitPolicy,
        DEFAULT_POLLING_INTERVAL,
    },
    runtime::{
        fail::Fail,
        network::{
            types::MacAddress,
            SharedPort,
        },
    },
};
use ::std::{
    fs,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Bond options. Scalar options may be overridden by an environment variable named after the option in upper case.
mod bonding_config {
    pub const SECTION_NAME: &str = "bonding";
    // Bonding mode, by name or number.
    pub const MODE: &str = "mode";
    // Header fields hashed by the balance and 802.3ad modes: l2, l23 or l34.
    pub const XMIT_POLICY: &str = "xmit_policy";
    // Preferred primary member.
    pub const PRIMARY: &str = "primary";
    // Default MAC address of the bond.
    pub const MAC: &str = "mac";
    pub const UP_DELAY_MS: &str = "up_delay_ms";
    pub const DOWN_DELAY_MS: &str = "down_delay_ms";
    pub const LSC_POLL_PERIOD_MS: &str = "lsc_poll_period_ms";
    pub const DEDICATED_QUEUES: &str = "dedicated_queues";
    // Port identifiers of the members.
    pub const MEMBERS: &str = "members";
    pub const NB_RX_QUEUES: &str = "nb_rx_queues";
    pub const NB_TX_QUEUES: &str = "nb_tx_queues";
    pub const MTU: &str = "mtu";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Bond configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let config_s: String = match fs::read_to_string(config_path) {
            Ok(config_s) => config_s,
            Err(e) => {
                let cause: String = format!("cannot read {} ({})", config_path, e);
                error!("new(): {}", cause);
                return Err(Fail::new(e.raw_os_error().unwrap_or(libc::EIO), &cause));
            },
        };
        Self::load_from_str(&config_s)
    }

    /// Parses a configuration document.
    pub fn load_from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration ({})", e);
                error!("load_from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };
        Ok(Self { 0: config_obj.clone() })
    }

    fn get_bonding_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, bonding_config::SECTION_NAME)
    }

    /// Reads the bonding mode from the environment variable first and then the configuration file. The mode is
    /// mandatory.
    pub fn mode(&self) -> Result<BondingMode, Fail> {
        if let Some(mode) = Self::get_typed_env_option(bonding_config::MODE)? {
            return Ok(mode);
        }
        let section: &Yaml = self.get_bonding_config()?;
        match Self::get_option(section, bonding_config::MODE)? {
            Yaml::Integer(value) => match u8::try_from(*value) {
                Ok(value) => BondingMode::try_from(value),
                Err(_) => {
                    let message: String = format!("parameter \"{}\" is out of range", bonding_config::MODE);
                    Err(Fail::new(libc::ERANGE, message.as_str()))
                },
            },
            Yaml::String(name) => name.parse(),
            _ => {
                let message: String = format!("parameter {} has unexpected type", bonding_config::MODE);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    pub fn xmit_policy(&self) -> Result<Option<XmitPolicy>, Fail> {
        self.get_parsed_option(bonding_config::XMIT_POLICY)
    }

    pub fn primary(&self) -> Result<Option<u16>, Fail> {
        if let Some(primary) = Self::get_typed_env_option(bonding_config::PRIMARY)? {
            return Ok(Some(primary));
        }
        Self::get_int_option(self.get_bonding_config()?, bonding_config::PRIMARY)
    }

    pub fn mac_addr(&self) -> Result<Option<MacAddress>, Fail> {
        self.get_parsed_option(bonding_config::MAC)
    }

    /// Delay before the bond link going up is reported. Zero if not set.
    pub fn link_up_delay(&self) -> Result<Duration, Fail> {
        Ok(self.get_millis_option(bonding_config::UP_DELAY_MS)?.unwrap_or(Duration::ZERO))
    }

    /// Delay before the bond link going down is reported. Zero if not set.
    pub fn link_down_delay(&self) -> Result<Duration, Fail> {
        Ok(self.get_millis_option(bonding_config::DOWN_DELAY_MS)?.unwrap_or(Duration::ZERO))
    }

    /// Period of the link polling monitor.
    pub fn link_monitoring_interval(&self) -> Result<Duration, Fail> {
        Ok(self
            .get_millis_option(bonding_config::LSC_POLL_PERIOD_MS)?
            .unwrap_or(DEFAULT_POLLING_INTERVAL))
    }

    pub fn dedicated_queues(&self) -> Result<bool, Fail> {
        if let Some(enabled) = Self::get_typed_env_option(bonding_config::DEDICATED_QUEUES)? {
            return Ok(enabled);
        }
        let section: &Yaml = self.get_bonding_config()?;
        match Self::get_optional(section, bonding_config::DEDICATED_QUEUES) {
            Some(Yaml::Boolean(enabled)) => Ok(*enabled),
            Some(_) => {
                let message: String = format!("parameter {} has unexpected type", bonding_config::DEDICATED_QUEUES);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            None => Ok(false),
        }
    }

    /// Port identifiers of the members. This cannot be passed in as an environment variable.
    pub fn members(&self) -> Result<Vec<u16>, Fail> {
        let section: &Yaml = self.get_bonding_config()?;
        let members: &Vec<Yaml> = match Self::get_optional(section, bonding_config::MEMBERS) {
            Some(Yaml::Array(members)) => members,
            Some(_) => {
                let message: String = format!("parameter {} has unexpected type", bonding_config::MEMBERS);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
            None => return Ok(Vec::new()),
        };
        let mut port_ids: Vec<u16> = Vec::with_capacity(members.len());
        for member in members {
            let port_id: i64 = match member.as_i64() {
                Some(port_id) => port_id,
                None => {
                    let cause: String = format!("member {:?} is not a port identifier", member);
                    error!("members(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            };
            match u16::try_from(port_id) {
                Ok(port_id) => port_ids.push(port_id),
                Err(_) => {
                    let cause: String = format!("member {} is out of range", port_id);
                    error!("members(): {}", cause);
                    return Err(Fail::new(libc::ERANGE, &cause));
                },
            }
        }
        Ok(port_ids)
    }

    /// Number of receive queues. One if not set.
    pub fn nb_rx_queues(&self) -> Result<u16, Fail> {
        Ok(self.get_env_or_int_option(bonding_config::NB_RX_QUEUES)?.unwrap_or(1))
    }

    /// Number of transmit queues. One if not set.
    pub fn nb_tx_queues(&self) -> Result<u16, Fail> {
        Ok(self.get_env_or_int_option(bonding_config::NB_TX_QUEUES)?.unwrap_or(1))
    }

    pub fn mtu(&self) -> Result<Option<u16>, Fail> {
        self.get_env_or_int_option(bonding_config::MTU)
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Index `yaml` to find a section at `index`, validating that it is a hash.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match Self::get_optional(yaml, index) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`. Missing and null values yield `None`.
    fn get_optional<'a>(yaml: &'a Yaml, index: &str) -> Option<&'a Yaml> {
        match yaml.index(index) {
            Yaml::BadValue | Yaml::Null => None,
            value => Some(value),
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Reads a string option of the bond section and parses it, the environment variable first.
    fn get_parsed_option<T: FromStr>(&self, index: &str) -> Result<Option<T>, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(Some(value));
        }
        match Self::get_optional(self.get_bonding_config()?, index) {
            Some(Yaml::String(value)) => match value.parse() {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    let message: String = format!("parameter {} has unexpected value {:?}", index, value);
                    Err(Fail::new(libc::EINVAL, message.as_str()))
                },
            },
            Some(_) => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            None => Ok(None),
        }
    }

    /// Reads an integer option, verifying that the destination type may hold it.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<Option<T>, Fail> {
        let val: i64 = match Self::get_optional(yaml, index) {
            Some(Yaml::Integer(val)) => *val,
            Some(_) => {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
            None => return Ok(None),
        };
        match T::try_from(val) {
            Ok(val) => Ok(Some(val)),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }

    fn get_env_or_int_option<T: FromStr + TryFrom<i64>>(&self, index: &str) -> Result<Option<T>, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(Some(value));
        }
        Self::get_int_option(self.get_bonding_config()?, index)
    }

    fn get_millis_option(&self, index: &str) -> Result<Option<Duration>, Fail> {
        let millis: Option<u64> = self.get_env_or_int_option(index)?;
        Ok(millis.map(Duration::from_millis))
    }
}

impl BondDevice {
    /// Builds a bond from a configuration. Members are looked up by port identifier in `ports`.
    pub fn from_config(name: &str, port_id: u16, config: &Config, ports: &[SharedPort]) -> Result<Self, Fail> {
        let bond: BondDevice = BondDevice::new(name, port_id, config.mode()?);
        if let Some(policy) = config.xmit_policy()? {
            bond.set_xmit_policy(policy)?;
        }
        bond.set_link_up_delay(config.link_up_delay()?)?;
        bond.set_link_down_delay(config.link_down_delay()?)?;
        bond.set_link_monitoring_interval(config.link_monitoring_interval()?)?;
        bond.configure(config.nb_rx_queues()?, config.nb_tx_queues()?)?;
        if let Some(mtu) = config.mtu()? {
            bond.set_mtu(mtu)?;
        }
        for member_id in config.members()? {
            match ports.iter().find(|port| port.port_id() == member_id) {
                Some(port) => bond.add_member(port.clone())?,
                None => {
                    let cause: String = format!("no port with identifier {}", member_id);
                    error!("from_config(): {}", cause);
                    return Err(Fail::new(libc::ENODEV, &cause));
                },
            }
        }
        if let Some(primary) = config.primary()? {
            bond.set_primary(primary)?;
        }
        if let Some(mac) = config.mac_addr()? {
            bond.set_mac_addr(mac)?;
        }
        if config.dedicated_queues()? {
            bond.enable_dedicated_queues(true)?;
        }
        info!("from_config(): bond {} configured ({} members)", name, bond.members().len());
        Ok(bond)
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
        runtime::network::SoftPort,
    };
    use ::anyhow::Result;

    const BALANCE_CONFIG: &str = r#"
bonding:
  mode: balance
  xmit_policy: l34
  primary: 2
  mac: "02:00:00:00:00:aa"
  down_delay_ms: 50
  members: [1, 2]
  nb_tx_queues: 2
"#;

    #[test]
    fn read_options_and_defaults() -> Result<()> {
        let config: Config = Config::load_from_str(BALANCE_CONFIG)?;
        ensure_eq!(config.mode()?, BondingMode::Balance);
        ensure_eq!(config.xmit_policy()?, Some(XmitPolicy::Layer34));
        ensure_eq!(config.primary()?, Some(2));
        ensure_eq!(config.mac_addr()?, Some(MacAddress::new([0x02, 0, 0, 0, 0, 0xaa])));
        ensure_eq!(config.link_down_delay()?, Duration::from_millis(50));
        ensure_eq!(config.link_up_delay()?, Duration::ZERO);
        ensure_eq!(config.members()?, vec![1, 2]);
        ensure_eq!(config.nb_rx_queues()?, 1);
        ensure_eq!(config.nb_tx_queues()?, 2);
        ensure_eq!(config.mtu()?, None);
        ensure_eq!(config.dedicated_queues()?, false);
        Ok(())
    }

    #[test]
    fn mode_by_number() -> Result<()> {
        let config: Config = Config::load_from_str("bonding:\n  mode: 4\n")?;
        ensure_eq!(config.mode()?, BondingMode::Lacp);
        let config: Config = Config::load_from_str("bonding:\n  mode: 7\n")?;
        ensure_eq!(config.mode().map_err(|e| e.errno), Err(libc::EINVAL));
        let config: Config = Config::load_from_str("bonding:\n  mode: 300\n")?;
        ensure_eq!(config.mode().map_err(|e| e.errno), Err(libc::ERANGE));
        Ok(())
    }

    #[test]
    fn malformed_and_out_of_range_values() -> Result<()> {
        let config: Config = Config::load_from_str("bonding:\n  mode: 0\n  xmit_policy: l5\n  nb_rx_queues: 70000\n")?;
        ensure_eq!(config.xmit_policy().map_err(|e| e.errno), Err(libc::EINVAL));
        ensure_eq!(config.nb_rx_queues().map_err(|e| e.errno), Err(libc::ERANGE));
        let config: Config = Config::load_from_str("bonding:\n  mode: 0\n  members: [1, \"x\"]\n")?;
        ensure_eq!(config.members().map_err(|e| e.errno), Err(libc::EINVAL));
        let config: Config = Config::load_from_str("other: {}\n")?;
        ensure_eq!(config.mode().map_err(|e| e.errno), Err(libc::EINVAL));
        Ok(())
    }

    #[test]
    fn environment_overrides_file() -> Result<()> {
        let config: Config = Config::load_from_str("bonding:\n  mode: 0\n  lsc_poll_period_ms: 20\n")?;
        ensure_eq!(config.link_monitoring_interval()?, Duration::from_millis(20));
        ::std::env::set_var("LSC_POLL_PERIOD_MS", "35");
        let interval: Result<Duration, Fail> = config.link_monitoring_interval();
        ::std::env::remove_var("LSC_POLL_PERIOD_MS");
        ensure_eq!(interval?, Duration::from_millis(35));
        Ok(())
    }

    #[test]
    fn build_bond_from_config() -> Result<()> {
        let ports: Vec<SharedPort> = (0..3u16)
            .map(|id| SoftPort::new(id, MacAddress::new([0x02, 0, 0, 0, 1, id as u8]), 10_000) as SharedPort)
            .collect();
        let config: Config = Config::load_from_str(BALANCE_CONFIG)?;
        let bond: BondDevice = BondDevice::from_config("net_bonding0", 100, &config, &ports)?;
        ensure_eq!(bond.mode(), BondingMode::Balance);
        ensure_eq!(bond.xmit_policy(), XmitPolicy::Layer34);
        ensure_eq!(bond.members(), vec![1, 2]);
        ensure_eq!(bond.configured_primary(), Some(2));
        ensure_eq!(bond.mac_addr(), MacAddress::new([0x02, 0, 0, 0, 0, 0xaa]));
        ensure_eq!(bond.nb_tx_queues()?, 2);
        ensure_eq!(bond.link_down_delay()?, Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn unknown_member_is_rejected() -> Result<()> {
        let ports: Vec<SharedPort> = vec![SoftPort::new(1, MacAddress::new([0x02, 0, 0, 0, 1, 1]), 10_000)];
        let config: Config = Config::load_from_str(BALANCE_CONFIG)?;
        match BondDevice::from_config("net_bonding0", 100, &config, &ports) {
            Err(e) => ensure_eq!(e.errno, libc::ENODEV),
            Ok(_) => anyhow::bail!("from_config() should fail on a missing port"),
        }
        Ok(())
    }
}
