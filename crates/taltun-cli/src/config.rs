//! Configuration loading: TOML file merged with CLI flag overrides.
//!
//! Precedence, lowest to highest: built-in defaults, `config.toml` (or the
//! file named by `--config`), command-line flags. Validation happens once
//! here; the engine receives only typed values.

use clap::Parser;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use taltun_core::{EngineConfig, Mode, PeerSetup};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const DEFAULT_LOCAL_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_TUN_NAME: &str = "tun0";
const DEFAULT_MTU: usize = 1420;

/// Configuration errors, all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("private key is required (config file or --key)")]
    MissingKey,

    #[error("private key must be 32 hex-encoded bytes: {0}")]
    InvalidKey(String),

    #[error("virtual IP is required (config file or --vip)")]
    MissingVip,

    #[error("invalid {what}: {value}")]
    Invalid { what: &'static str, value: String },
}

/// taltun, a peer-to-peer mesh VPN data plane.
#[derive(Debug, Parser)]
#[command(name = "taltun", version, about)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override: operating mode (client | server | lighthouse).
    #[arg(long)]
    pub mode: Option<String>,

    /// Override: UDP bind address.
    #[arg(long)]
    pub local: Option<String>,

    /// Override: TUN interface name.
    #[arg(long)]
    pub tun: Option<String>,

    /// Override: hex-encoded X25519 private key.
    #[arg(long)]
    pub key: Option<String>,

    /// Override: this node's virtual IP.
    #[arg(long)]
    pub vip: Option<String>,

    /// Override: TUN MTU.
    #[arg(long)]
    pub mtu: Option<usize>,

    /// Verbose data-plane logging.
    #[arg(long)]
    pub debug: bool,

    /// Shorthand peer spec: `VIP[,ENDPOINT]`.
    #[arg(long)]
    pub peer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    interface: InterfaceSection,
    #[serde(default)]
    peers: Vec<PeerSection>,
}

#[derive(Debug, Default, Deserialize)]
struct InterfaceSection {
    mode: Option<String>,
    local_addr: Option<String>,
    tun_name: Option<String>,
    private_key: Option<String>,
    vip: Option<String>,
    mtu: Option<usize>,
    debug: Option<bool>,
    #[serde(default)]
    routes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PeerSection {
    vip: String,
    endpoint: Option<String>,
    #[serde(default)]
    allowed_ips: Vec<String>,
}

/// Load, merge, and validate configuration.
///
/// # Errors
///
/// Any missing mandatory value or unparsable field.
pub fn load(cli: &Cli) -> Result<(EngineConfig, Vec<PeerSetup>), ConfigError> {
    let file = read_file(cli)?;

    let mode = parse_mode(
        cli.mode
            .as_deref()
            .or(file.interface.mode.as_deref())
            .unwrap_or("client"),
    )?;

    let local_str = cli
        .local
        .as_deref()
        .or(file.interface.local_addr.as_deref())
        .unwrap_or(DEFAULT_LOCAL_ADDR);
    let local_bind: SocketAddr = local_str.parse().map_err(|_| ConfigError::Invalid {
        what: "bind address",
        value: local_str.to_string(),
    })?;

    let tun_name = cli
        .tun
        .clone()
        .or(file.interface.tun_name.clone())
        .unwrap_or_else(|| DEFAULT_TUN_NAME.to_string());
    let mtu = cli.mtu.or(file.interface.mtu).unwrap_or(DEFAULT_MTU);
    let debug = cli.debug || file.interface.debug.unwrap_or(false);

    let key_hex = cli
        .key
        .as_deref()
        .or(file.interface.private_key.as_deref())
        .ok_or(ConfigError::MissingKey)?;
    let secret_key = parse_key(key_hex)?;

    let vip_str = cli
        .vip
        .as_deref()
        .or(file.interface.vip.as_deref())
        .ok_or(ConfigError::MissingVip)?;
    let local_vip: Ipv4Addr = vip_str.parse().map_err(|_| ConfigError::Invalid {
        what: "virtual IP",
        value: vip_str.to_string(),
    })?;

    let routes = file
        .interface
        .routes
        .iter()
        .map(|s| parse_net(s))
        .collect::<Result<Vec<_>, _>>()?;

    let mut peers = file
        .peers
        .iter()
        .map(parse_peer)
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(spec) = &cli.peer {
        peers.push(parse_legacy_peer(spec)?);
    }

    Ok((
        EngineConfig {
            mode,
            local_bind,
            tun_name,
            mtu,
            secret_key,
            local_vip,
            routes,
            debug,
        },
        peers,
    ))
}

fn read_file(cli: &Cli) -> Result<FileConfig, ConfigError> {
    let path = &cli.config;
    if path.exists() {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&data)?)
    } else if path.as_os_str() != DEFAULT_CONFIG_PATH {
        // An explicitly named file must exist; the default is optional.
        Err(ConfigError::Read {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    } else {
        Ok(FileConfig::default())
    }
}

fn parse_mode(s: &str) -> Result<Mode, ConfigError> {
    match s {
        "client" => Ok(Mode::Client),
        "server" => Ok(Mode::Server),
        "lighthouse" => Ok(Mode::Lighthouse),
        other => Err(ConfigError::Invalid {
            what: "mode",
            value: other.to_string(),
        }),
    }
}

fn parse_key(hex_str: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|err| ConfigError::InvalidKey(err.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidKey(format!("got {len} bytes")))
}

fn parse_net(s: &str) -> Result<Ipv4Net, ConfigError> {
    s.parse().map_err(|_| ConfigError::Invalid {
        what: "CIDR",
        value: s.to_string(),
    })
}

fn parse_endpoint(s: &str) -> Result<SocketAddr, ConfigError> {
    s.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::Invalid {
            what: "endpoint",
            value: s.to_string(),
        })
}

fn parse_peer(section: &PeerSection) -> Result<PeerSetup, ConfigError> {
    let vip: Ipv4Addr = section.vip.parse().map_err(|_| ConfigError::Invalid {
        what: "peer VIP",
        value: section.vip.clone(),
    })?;
    let endpoint = section
        .endpoint
        .as_deref()
        .map(parse_endpoint)
        .transpose()?;
    let allowed_ips = section
        .allowed_ips
        .iter()
        .map(|s| parse_net(s))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PeerSetup {
        vip,
        endpoint,
        allowed_ips,
    })
}

fn parse_legacy_peer(spec: &str) -> Result<PeerSetup, ConfigError> {
    let mut parts = spec.splitn(2, ',');
    let vip_str = parts.next().unwrap_or_default();
    let vip: Ipv4Addr = vip_str.parse().map_err(|_| ConfigError::Invalid {
        what: "peer VIP",
        value: vip_str.to_string(),
    })?;
    let endpoint = parts.next().map(parse_endpoint).transpose()?;
    Ok(PeerSetup {
        vip,
        endpoint,
        allowed_ips: Vec::new(),
    })
}
