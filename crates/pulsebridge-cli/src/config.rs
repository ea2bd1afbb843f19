//! Configuration – merges flags, `PULSEBRIDGE_*` variables,
//! `~/.pulsebridge/config.toml` and defaults into one validated
//! [`BridgeConfig`].
//!
//! Precedence, highest first: command-line flag, environment variable (both
//! handled by clap), config file, built-in default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pulsebridge_hal::{DEFAULT_GPIO_ROOT, DEFAULT_POLL_INTERVAL};
use pulsebridge_kernel::DEFAULT_CALIBRATION;
use pulsebridge_middleware::parse_server_address;
use pulsebridge_types::{BridgeError, LineId, VirtualPin};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::args::{Cli, Command, PowerArgs, RelayArgs};

const DEFAULT_SERVER: &str = "tcp://127.0.0.1:8080";
const DEFAULT_PIN: LineId = 18;
const DEFAULT_DEVICE_URL: &str = "ws://192.168.1.17/ws";
const DEFAULT_RELAY_PIN: u32 = 0;

// ─────────────────────────────────────────────────────────────────────────────
// File layout
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of `config.toml`. Every key is optional.
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<String>,
    pub token: Option<String>,
    pub debug: Option<bool>,
    pub power: PowerSection,
    pub relay: RelaySection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PowerSection {
    pub pin: Option<u32>,
    pub virtual_pin: Option<u32>,
    pub calibration: Option<f64>,
    pub gpio_root: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySection {
    pub device_url: Option<String>,
    pub virtual_pin: Option<u32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved configuration
// ─────────────────────────────────────────────────────────────────────────────

pub struct BridgeConfig {
    pub server: String,
    pub token: Zeroizing<String>,
    pub debug: bool,
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Power(PowerConfig),
    Relay(RelayConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerConfig {
    pub pin: LineId,
    pub virtual_pin: VirtualPin,
    pub calibration: f64,
    pub gpio_root: PathBuf,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub device_url: String,
    pub virtual_pin: VirtualPin,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("server", &self.server)
            .field(
                "token",
                if self.token.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("debug", &self.debug)
            .field("mode", &self.mode)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.pulsebridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pulsebridge").join("config.toml")
}

/// Read a config file. `Ok(None)` when it does not exist.
pub fn load_file(path: &Path) -> Result<Option<FileConfig>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let file = toml::from_str(&raw).map_err(|e| {
        BridgeError::Configuration(format!("cannot parse {}: {e}", path.display()))
    })?;
    Ok(Some(file))
}

/// Load the file named by `--config` (which must exist) or the default one
/// (which may be absent), then resolve against `cli`.
pub fn load(cli: &Cli) -> Result<BridgeConfig, BridgeError> {
    let file = match &cli.config {
        Some(path) => load_file(path)?.ok_or_else(|| {
            BridgeError::Configuration(format!("config file {} not found", path.display()))
        })?,
        None => load_file(&config_path())?.unwrap_or_default(),
    };
    resolve(cli, &file)
}

/// Merge `cli` over `file` over defaults and validate the result.
pub fn resolve(cli: &Cli, file: &FileConfig) -> Result<BridgeConfig, BridgeError> {
    let server = cli
        .server
        .clone()
        .or_else(|| file.server.clone())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    parse_server_address(&server)?;

    let token = cli
        .token
        .clone()
        .or_else(|| file.token.clone())
        .unwrap_or_default();
    let token = Zeroizing::new(token.trim().to_string());
    if token.is_empty() {
        return Err(BridgeError::Configuration(
            "an authorization token is required (-a/--authorization or PULSEBRIDGE_TOKEN)"
                .to_string(),
        ));
    }

    let mode = match &cli.command {
        Command::Power(args) => Mode::Power(resolve_power(args, &file.power)?),
        Command::Relay(args) => Mode::Relay(resolve_relay(args, &file.relay)?),
    };

    Ok(BridgeConfig {
        server,
        token,
        debug: cli.debug || file.debug.unwrap_or(false),
        mode,
    })
}

fn resolve_power(args: &PowerArgs, file: &PowerSection) -> Result<PowerConfig, BridgeError> {
    let pin = args.pin.or(file.pin).unwrap_or(DEFAULT_PIN);
    let virtual_pin = args.virtual_pin.or(file.virtual_pin).unwrap_or(pin);

    let calibration = args
        .calibration
        .or(file.calibration)
        .unwrap_or(DEFAULT_CALIBRATION);
    if !calibration.is_finite() || calibration <= 0.0 {
        return Err(BridgeError::Configuration(format!(
            "calibration must be a positive number, got {calibration}"
        )));
    }

    let poll_interval = match args.poll_interval_ms.or(file.poll_interval_ms) {
        Some(0) => {
            return Err(BridgeError::Configuration(
                "poll interval must be at least 1 ms".to_string(),
            ));
        }
        Some(ms) => Duration::from_millis(ms),
        None => DEFAULT_POLL_INTERVAL,
    };

    let gpio_root = args
        .gpio_root
        .clone()
        .or_else(|| file.gpio_root.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_GPIO_ROOT));

    Ok(PowerConfig {
        pin,
        virtual_pin: VirtualPin(virtual_pin),
        calibration,
        gpio_root,
        poll_interval,
    })
}

fn resolve_relay(args: &RelayArgs, file: &RelaySection) -> Result<RelayConfig, BridgeError> {
    let device_url = args
        .device_url
        .clone()
        .or_else(|| file.device_url.clone())
        .unwrap_or_else(|| DEFAULT_DEVICE_URL.to_string());
    if !(device_url.starts_with("ws://") || device_url.starts_with("wss://")) {
        return Err(BridgeError::Configuration(format!(
            "device url '{device_url}' must start with ws:// or wss://"
        )));
    }
    let virtual_pin = args
        .virtual_pin
        .or(file.virtual_pin)
        .unwrap_or(DEFAULT_RELAY_PIN);
    Ok(RelayConfig {
        device_url,
        virtual_pin: VirtualPin(virtual_pin),
    })
}
