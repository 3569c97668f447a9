// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::bondport::{
    protocols::FrameBuilder,
    runtime::{
        logging,
        network::SoftPort,
    },
    BondDevice,
    BondTxQueue,
    BondingMode,
    Config,
    MacAddress,
    Mbuf,
    SharedPort,
    XmitPolicy,
};
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};
use ::histogram::Histogram;
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Program Arguments
//======================================================================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Bonding mode.
    mode: BondingMode,
    /// Number of members.
    members: u16,
    /// Transmit hash policy.
    policy: XmitPolicy,
    /// Number of distinct flows.
    flows: usize,
    /// Number of bursts to send.
    bursts: usize,
    /// Packets per burst.
    burst_size: usize,
    /// Optional configuration file.
    config: Option<String>,
}

/// Associate functions for Program Arguments
impl ProgramArguments {
    const DEFAULT_MODE: BondingMode = BondingMode::Balance;
    const DEFAULT_MEMBERS: u16 = 4;
    const DEFAULT_FLOWS: usize = 64;
    const DEFAULT_BURSTS: usize = 10_000;
    const DEFAULT_BURST_SIZE: usize = 32;

    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("mode")
                    .long("mode")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("MODE")
                    .help("Sets bonding mode (name or number)"),
            )
            .arg(
                Arg::new("members")
                    .long("members")
                    .value_parser(clap::value_parser!(u16))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets number of member ports"),
            )
            .arg(
                Arg::new("policy")
                    .long("policy")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("l2|l23|l34")
                    .help("Sets transmit hash policy"),
            )
            .arg(
                Arg::new("flows")
                    .long("flows")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets number of flows"),
            )
            .arg(
                Arg::new("bursts")
                    .long("bursts")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets number of bursts"),
            )
            .arg(
                Arg::new("burst-size")
                    .long("burst-size")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("SIZE")
                    .help("Sets packets per burst"),
            )
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Reads bond settings from a configuration file"),
            )
            .get_matches();

        let mut args: ProgramArguments = ProgramArguments {
            mode: Self::DEFAULT_MODE,
            members: Self::DEFAULT_MEMBERS,
            policy: XmitPolicy::Layer34,
            flows: Self::DEFAULT_FLOWS,
            bursts: Self::DEFAULT_BURSTS,
            burst_size: Self::DEFAULT_BURST_SIZE,
            config: matches.get_one::<String>("config").cloned(),
        };

        if let Some(mode) = matches.get_one::<String>("mode") {
            args.mode = mode.parse()?;
        }
        if let Some(members) = matches.get_one::<u16>("members") {
            args.set_members(*members)?;
        }
        if let Some(policy) = matches.get_one::<String>("policy") {
            args.policy = policy.parse()?;
        }
        if let Some(flows) = matches.get_one::<usize>("flows") {
            args.set_flows(*flows)?;
        }
        if let Some(bursts) = matches.get_one::<usize>("bursts") {
            args.bursts = *bursts;
        }
        if let Some(burst_size) = matches.get_one::<usize>("burst-size") {
            args.set_burst_size(*burst_size)?;
        }

        Ok(args)
    }

    fn set_members(&mut self, members: u16) -> Result<()> {
        if members > 0 && members <= 32 {
            self.members = members;
            Ok(())
        } else {
            anyhow::bail!("invalid number of members")
        }
    }

    fn set_flows(&mut self, flows: usize) -> Result<()> {
        if flows > 0 {
            self.flows = flows;
            Ok(())
        } else {
            anyhow::bail!("invalid number of flows")
        }
    }

    fn set_burst_size(&mut self, burst_size: usize) -> Result<()> {
        if burst_size > 0 {
            self.burst_size = burst_size;
            Ok(())
        } else {
            anyhow::bail!("invalid burst size")
        }
    }
}

//======================================================================================================================
// Application
//======================================================================================================================

/// A UDP flow.
struct Flow {
    dst_ipv4: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
}

/// Application
struct Application {
    bond: BondDevice,
    ports: Vec<Arc<SoftPort>>,
    txq: BondTxQueue,
    flows: Vec<Flow>,
    rng: SmallRng,
    bursts: usize,
    burst_size: usize,
}

/// Associated Functions for the Application
impl Application {
    const BOND_PORT_ID: u16 = 100;
    const LINK_SPEED_MBPS: u32 = 10_000;
    const LOCAL_IPV4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const REMOTE_MAC: MacAddress = MacAddress::new([0x02, 0xff, 0x00, 0x00, 0x00, 0x01]);
    const SEED: u64 = 0x62_6f_6e_64;

    /// Instantiates the application.
    pub fn new(args: &ProgramArguments) -> Result<Self> {
        let ports: Vec<Arc<SoftPort>> = (0..args.members)
            .map(|port_id| {
                SoftPort::new(
                    port_id,
                    MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x01, port_id as u8]),
                    Self::LINK_SPEED_MBPS,
                )
            })
            .collect();

        let bond: BondDevice = match args.config {
            Some(ref path) => {
                let config: Config = Config::new(path)?;
                let shared: Vec<SharedPort> = ports.iter().map(|port| port.clone() as SharedPort).collect();
                BondDevice::from_config("net_bonding0", Self::BOND_PORT_ID, &config, &shared)?
            },
            None => {
                let bond: BondDevice = BondDevice::new("net_bonding0", Self::BOND_PORT_ID, args.mode);
                bond.set_xmit_policy(args.policy)?;
                for port in ports.iter() {
                    bond.add_member(port.clone())?;
                }
                bond
            },
        };
        bond.start()?;
        let txq: BondTxQueue = bond.tx_queue(0)?;

        let mut rng: SmallRng = SmallRng::seed_from_u64(Self::SEED);
        let flows: Vec<Flow> = (0..args.flows)
            .map(|_| Flow {
                dst_ipv4: Ipv4Addr::new(10, 1, rng.gen(), rng.gen()),
                src_port: rng.gen_range(1024..u16::MAX),
                dst_port: rng.gen_range(1..1024),
            })
            .collect();

        println!("{}", bond);
        Ok(Self {
            bond,
            ports,
            txq,
            flows,
            rng,
            bursts: args.bursts,
            burst_size: args.burst_size,
        })
    }

    /// Runs the target application. Member 0 fails halfway through and comes back for the last quarter.
    pub fn run(&mut self) -> Result<()> {
        // Buckets with 2^7 subdivisions, up to 2^40 ns.
        let mut latencies: Histogram = Histogram::new(7, 40)?;
        let mut sent: Vec<u64> = vec![0; self.ports.len()];
        let mut unsent: u64 = 0;
        let bond_mac: MacAddress = self.bond.mac_addr();

        for burst in 0..self.bursts {
            if burst == self.bursts / 2 {
                self.ports[0].set_link_down();
                println!("port 0 down: active members {:?}", self.bond.active_members());
            } else if burst == self.bursts * 3 / 4 {
                self.ports[0].set_link_up(Self::LINK_SPEED_MBPS);
                println!("port 0 up: active members {:?}", self.bond.active_members());
            }

            let mut pkts: Vec<Mbuf> = (0..self.burst_size).map(|_| self.next_packet(bond_mac)).collect();
            let start: Instant = Instant::now();
            let nb_tx: usize = self.txq.tx_burst(&mut pkts);
            latencies.increment(start.elapsed().as_nanos() as u64)?;
            unsent += (self.burst_size - nb_tx) as u64;

            for (port, count) in self.ports.iter().zip(sent.iter_mut()) {
                *count += port.take_tx().len() as u64;
            }
        }

        println!("Distribution:");
        let total: u64 = sent.iter().sum::<u64>().max(1);
        for (port_id, count) in sent.iter().enumerate() {
            println!("  port {}: {} packets ({:.1}%)", port_id, count, *count as f64 * 100.0 / total as f64);
        }
        println!("  unsent: {} packets", unsent);
        print_latencies(&latencies);
        println!("{}", self.bond);
        Ok(())
    }

    fn next_packet(&mut self, bond_mac: MacAddress) -> Mbuf {
        let flow: &Flow = &self.flows[self.rng.gen_range(0..self.flows.len())];
        FrameBuilder::new(Self::REMOTE_MAC, bond_mac)
            .ipv4(Self::LOCAL_IPV4, flow.dst_ipv4)
            .udp(flow.src_port, flow.dst_port)
            .payload_len(64)
            .build()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Application {
    fn drop(&mut self) {
        if let Err(e) = self.bond.close() {
            println!("ERROR: close() failed (error={:?})", e);
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Prints percentiles of burst call durations.
fn print_latencies(h: &Histogram) {
    let total: u64 = h.into_iter().map(|bucket| bucket.count()).sum();
    if total == 0 {
        return;
    }
    println!("tx_burst() latency:");
    for percentile in [0.25, 0.50, 0.75, 0.90, 0.99, 0.999] {
        let rank: u64 = ((total as f64) * percentile).ceil() as u64;
        let mut seen: u64 = 0;
        for bucket in h.into_iter() {
            seen += bucket.count();
            if seen >= rank {
                println!("  p{:<5} {:?}", percentile * 100.0, Duration::from_nanos(bucket.end()));
                break;
            }
        }
    }
}

/// Drives the application.
fn main() -> Result<()> {
    logging::initialize();
    let args: ProgramArguments = ProgramArguments::new(
        "bond-pktgen",
        "Microsoft Corporation",
        "Generates UDP traffic over a bond of software ports.",
    )?;
    Application::new(&args)?.run()
}
