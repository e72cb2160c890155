//! ECM agent
//!
//! Vehicle-side agent that installs, uninstalls, restores and reloads plugins
//! on the vehicle's ECUs on behalf of the trusted server.
//!
//! - **ECU listener**: accepts ECU sessions and routes commands by ECU id
//! - **Uplink**: session with the trusted server; batches go to the unpacker
//! - **Telemetry**: relays ECU publish messages to the IoT endpoint
//! - **Coordinator**: single actor owning in-flight operations and the store

use anyhow::Result;
use ecm_agent::{agent, Config};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        vin = %config.vin,
        trusted_server_addr = %config.trusted_server_addr,
        iot_server_addr = %config.iot_server_addr,
        ecu_listen_addr = %config.ecu_listen_addr,
        app_dir = %config.app_dir.display(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent = tokio::spawn(agent::run(config, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut agent => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Agent failed");
                    Err(e)
                }
                Err(e) => Err(e.into()),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    agent.await??;

    info!("ECM agent shutdown complete");
    Ok(())
}
