//! `pulsebridge` – bridges a pulse-counting input (or a device hub) to a
//! virtual-pin broker.
//!
//! 1. Resolves configuration from flags, `PULSEBRIDGE_*` variables and
//!    `~/.pulsebridge/config.toml`; nothing is touched if it is invalid.
//! 2. Connects to the broker and runs the selected bridge until Ctrl-C.
//! 3. Exits `0` after a clean shutdown; otherwise prints one `error:` line
//!    and exits with a code that names the failure class.

mod args;
mod config;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tracing::{debug, warn};

use pulsebridge_hal::SysfsLineDriver;
use pulsebridge_middleware::{ClientOptions, PublishSink, VirtualPinClient};
use pulsebridge_runtime::{
    LifecycleController, RelayController, RunOutcome, ShutdownSignal, init_tracing,
};
use pulsebridge_types::BridgeError;

use crate::args::Cli;
use crate::config::{BridgeConfig, Mode};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match config::load(&cli) {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };

    let _guard = init_tracing("pulsebridge", config.debug);
    debug!(?config, "configuration resolved");

    let (trigger, signal) = ShutdownSignal::new();
    if let Err(e) = ctrlc::set_handler(move || {
        if !trigger.is_triggered() {
            eprintln!();
            eprintln!("{}", "Ctrl-C received, shutting down …".yellow().bold());
        }
        trigger.trigger();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process with SIGKILL");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return fail(&BridgeError::Channel(format!("cannot start runtime: {e}"))),
    };

    match runtime.block_on(run(config, signal)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

async fn run(config: BridgeConfig, signal: ShutdownSignal) -> Result<(), BridgeError> {
    let client =
        VirtualPinClient::connect(&config.server, config.token.as_str(), ClientOptions::default())
            .await?;
    let sink: Arc<dyn PublishSink> = Arc::new(client);

    match config.mode {
        Mode::Power(power) => {
            let driver = Arc::new(
                SysfsLineDriver::with_root(power.gpio_root)
                    .with_poll_interval(power.poll_interval),
            );
            let controller = LifecycleController::new(sink, driver, power.pin, power.virtual_pin)
                .with_calibration(power.calibration);
            match controller.run(signal).await? {
                RunOutcome::Unauthorized => Err(rejected()),
                RunOutcome::Completed(report) => {
                    println!(
                        "{} {} pulses, {} published, {} failed",
                        "✓".green().bold(),
                        report.edges.rising,
                        report.delivery.published,
                        report.delivery.failed,
                    );
                    Ok(())
                }
            }
        }
        Mode::Relay(relay) => {
            let controller = RelayController::new(sink, relay.device_url, relay.virtual_pin);
            match controller.run(signal).await? {
                RunOutcome::Unauthorized => Err(rejected()),
                RunOutcome::Completed(report) => {
                    println!(
                        "{} {} events, {} published, {} failed",
                        "✓".green().bold(),
                        report.messages,
                        report.delivery.published,
                        report.delivery.failed,
                    );
                    Ok(())
                }
            }
        }
    }
}

fn rejected() -> BridgeError {
    BridgeError::Unauthorized("the broker rejected the token".to_string())
}

/// Process exit code for each failure class.
fn exit_code(err: &BridgeError) -> u8 {
    match err {
        BridgeError::Configuration(_) => 2,
        BridgeError::Unauthorized(_) => 3,
        BridgeError::ResourceUnavailable { .. } => 4,
        _ => 1,
    }
}

fn fail(err: &BridgeError) -> ExitCode {
    eprintln!("{} {err}", "error:".red().bold());
    ExitCode::from(exit_code(err))
}
