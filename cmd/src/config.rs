//! Launch configuration: command-line flags validated into a typed config.

use anyhow::{bail, Context};
use bm_net::uart::{UartConfig, SUPPORTED_BAUD_RATES};
use bm_net::{socket_path, MAX_SOCKET_PATH};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Linux-hosted Bristlemouth mesh node
#[derive(Parser, Debug)]
#[command(name = "bm-sbc", version, about = "Linux-hosted Bristlemouth mesh node")]
pub struct Args {
    /// This node's 64-bit identifier, in hex (e.g. 0x1)
    #[arg(long)]
    pub node_id: String,

    /// Directly-connected peer identifier, in hex; repeatable, one port
    /// per flag in the order given
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Directory for the datagram socket files
    #[arg(long, default_value = "/tmp")]
    pub socket_dir: PathBuf,

    /// Serial device bridging an off-host mesh segment (enables gateway
    /// mode), e.g. /dev/ttyUSB0
    #[arg(long)]
    pub uart: Option<String>,

    /// Serial bit rate
    #[arg(long, default_value_t = 115200)]
    pub baud: u32,

    /// Interval between neighbor heartbeats
    #[arg(long, default_value = "10s")]
    pub heartbeat_interval: humantime::Duration,

    /// Silence after which a neighbor is dropped
    #[arg(long, default_value = "30s")]
    pub neighbor_timeout: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Validated launch configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// This node's identifier.
    pub node_id: u64,
    /// Peer identifiers in declared (port) order.
    pub peers: Vec<u64>,
    /// Directory for the datagram socket files.
    pub socket_dir: PathBuf,
    /// Serial line parameters; present iff gateway mode is selected.
    pub uart: Option<UartConfig>,
    /// Interval between neighbor heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which a neighbor is dropped.
    pub neighbor_timeout: Duration,
    /// Log level for this process's crates.
    pub log_level: String,
}

impl LaunchConfig {
    /// Validate raw flags.
    ///
    /// More than fifteen peers is not an error here: the device truncates
    /// the list and logs its cap warning.
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let node_id = parse_node_id(&args.node_id).context("--node-id")?;
        if node_id == 0 {
            bail!("--node-id must be non-zero");
        }

        let peers = args
            .peers
            .iter()
            .map(|raw| {
                let peer = parse_node_id(raw).with_context(|| format!("--peer {raw}"))?;
                if peer == 0 {
                    bail!("--peer must be non-zero");
                }
                Ok(peer)
            })
            .collect::<anyhow::Result<Vec<u64>>>()?;

        let own_socket = socket_path(&args.socket_dir, node_id);
        if own_socket.as_os_str().len() + 1 > MAX_SOCKET_PATH {
            bail!(
                "socket directory {} leaves no room for the socket name (path limit {} bytes)",
                args.socket_dir.display(),
                MAX_SOCKET_PATH
            );
        }

        let uart = match args.uart {
            Some(path) => {
                if !SUPPORTED_BAUD_RATES.contains(&args.baud) {
                    bail!(
                        "unsupported baud rate {} (supported: {:?})",
                        args.baud,
                        SUPPORTED_BAUD_RATES
                    );
                }
                Some(UartConfig {
                    path,
                    baud: args.baud,
                })
            }
            None => None,
        };

        Ok(Self {
            node_id,
            peers,
            socket_dir: args.socket_dir,
            uart,
            heartbeat_interval: args.heartbeat_interval.into(),
            neighbor_timeout: args.neighbor_timeout.into(),
            log_level: args.log_level,
        })
    }
}

fn parse_node_id(raw: &str) -> anyhow::Result<u64> {
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("malformed node identifier {raw:?}"))
}
