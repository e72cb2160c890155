//! Configuration for the ECM agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ecm_messages::EcuId;

/// ECM agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Vehicle identification number reported upstream.
    pub vin: String,

    /// Directory holding installed plugin binaries.
    pub app_dir: PathBuf,

    /// Directory holding restored plugin binaries.
    pub restore_dir: PathBuf,

    /// SQLite file for durable plugin records.
    pub db_path: PathBuf,

    /// Trusted server address.
    pub trusted_server_addr: String,

    /// IoT collection endpoint address.
    pub iot_server_addr: String,

    /// Listen address for ECU sessions.
    pub ecu_listen_addr: SocketAddr,

    /// ECUs whose installed plugins are reloaded at startup.
    pub startup_ecus: Vec<EcuId>,

    /// Delay between consecutive startup loads.
    pub load_pacing: Duration,

    /// Age after which an unacknowledged operation is expired.
    pub ack_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let vin = std::env::var("ECM_VIN").unwrap_or_else(|_| "VIN-UNKNOWN".to_string());

        let app_dir = std::env::var("ECM_APP_DIR")
            .unwrap_or_else(|_| "/var/lib/ecm/apps".to_string())
            .into();

        let restore_dir = std::env::var("ECM_RESTORE_DIR")
            .unwrap_or_else(|_| "/var/lib/ecm/restore".to_string())
            .into();

        let db_path = std::env::var("ECM_DB_PATH")
            .unwrap_or_else(|_| "/var/lib/ecm/plugins.db".to_string())
            .into();

        let trusted_server_addr = std::env::var("ECM_TRUSTED_SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9090".to_string());

        let iot_server_addr =
            std::env::var("ECM_IOT_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:9091".to_string());

        let ecu_listen_addr = std::env::var("ECM_ECU_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9092".to_string())
            .parse()
            .context("ECM_ECU_LISTEN_ADDR is not a socket address")?;

        let startup_ecus = match std::env::var("ECM_STARTUP_ECUS") {
            Ok(raw) => parse_ecu_list(&raw)?,
            Err(_) => vec![2, 3],
        };

        let load_pacing = Duration::from_millis(
            std::env::var("ECM_LOAD_PACING_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2000),
        );

        let ack_timeout = Duration::from_secs(
            std::env::var("ECM_ACK_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(120),
        );

        let log_level = std::env::var("ECM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            vin,
            app_dir,
            restore_dir,
            db_path,
            trusted_server_addr,
            iot_server_addr,
            ecu_listen_addr,
            startup_ecus,
            load_pacing,
            ack_timeout,
            log_level,
        })
    }
}

/// Parse a comma-separated ECU id list. Empty items are skipped.
pub fn parse_ecu_list(raw: &str) -> Result<Vec<EcuId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<EcuId>()
                .with_context(|| format!("invalid ECU id in ECM_STARTUP_ECUS: {s:?}"))
        })
        .collect()
}
