//! Command-line arguments.
//!
//! Every value is optional here; [`crate::config::resolve`] layers them over
//! the config file and built-in defaults.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Bridge hardware pulses and device events to a virtual-pin broker.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pulsebridge", version, about)]
pub struct Cli {
    /// Broker address (tcp://host:port)
    #[arg(short, long, env = "PULSEBRIDGE_SERVER", global = true)]
    pub server: Option<String>,

    /// Device authorization token
    #[arg(
        short = 'a',
        long = "authorization",
        env = "PULSEBRIDGE_TOKEN",
        hide_env_values = true,
        global = true
    )]
    pub token: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Config file (default ~/.pulsebridge/config.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Publish power computed from the interval between meter pulses
    Power(PowerArgs),
    /// Forward device-hub websocket events as text
    Relay(RelayArgs),
}

impl Default for Command {
    fn default() -> Self {
        Command::Power(PowerArgs::default())
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct PowerArgs {
    /// GPIO line the pulse input is wired to
    #[arg(short, long, env = "PULSEBRIDGE_PIN")]
    pub pin: Option<u32>,

    /// Virtual pin to publish to (defaults to the GPIO line number)
    #[arg(long)]
    pub virtual_pin: Option<u32>,

    /// Rate per pulse-per-second (3600 turns Wh pulses into watts)
    #[arg(long, env = "PULSEBRIDGE_CALIBRATION")]
    pub calibration: Option<f64>,

    /// sysfs GPIO directory
    #[arg(long)]
    pub gpio_root: Option<PathBuf>,

    /// Input polling interval in milliseconds, used when the line has no edge interrupts
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RelayArgs {
    /// Device hub websocket URL
    #[arg(long, env = "PULSEBRIDGE_DEVICE_URL")]
    pub device_url: Option<String>,

    /// Virtual pin to publish to
    #[arg(long)]
    pub virtual_pin: Option<u32>,
}
