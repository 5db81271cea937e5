//! # Bus Runtime
//!
//! Entry point: loads configuration from the environment, installs
//! telemetry, and runs the bus until SIGINT/SIGTERM.
//!
//! See `bus_telemetry` and `message_bus::BusConfig::from_env` for the
//! recognised `BUS_*` variables.

use anyhow::{Context, Result};
use bus_runtime::BusRuntime;
use bus_telemetry::{init_telemetry, TelemetryConfig};
use message_bus::{BusConfig, ShutdownCoordinator};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry =
        init_telemetry(TelemetryConfig::from_env()).context("failed to initialise telemetry")?;

    let config = BusConfig::from_env().context("invalid bus configuration")?;
    let coordinator = ShutdownCoordinator::install();

    info!("Press Ctrl+C to stop.");
    BusRuntime::new(config).run(coordinator.signal()).await?;

    Ok(())
}
