//! Data-diode bridge entry point.
//!
//! Loads the shared manifest, then runs as either the transmit side
//! (anode) or the receive side (cathode) depending on the manifest's
//! `Function:` line. Both sides run until Ctrl+C / SIGTERM.

use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use diodesrv::db::{Database, DbConfig};
use diodesrv::runtime::{anode, cathode};
use diodesrv::{load_manifest, logging, Role, Settings};

/// Environment variable supplying the database password on the receive
/// side (never persisted to Settings.xml).
const DB_PASSWORD_ENV: &str = "DIODE_DB_PASSWORD";

#[derive(Parser)]
#[command(
    name = "diodesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Unidirectional data-diode bridge for Modbus recorders and devices"
)]
struct Args {
    /// Main manifest file (shared verbatim by both sides of the diode)
    #[arg(short, long, default_value = "./config.txt")]
    config: String,

    /// Persisted settings file
    #[arg(long, default_value = "./Settings.xml")]
    settings: String,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let args = Args::parse();
    logging::init(&args.log_level, logging::SEVERE_LOG_FILE);

    let settings = match Settings::load_or_create(&args.settings) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Unable to load settings: {e}");
            Settings::default()
        }
    };

    let manifest = match load_manifest(&args.config) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!("Unable to read configuration file: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "Manifest loaded: {} recorders, {} Modbus devices",
        manifest.recorders.len(),
        manifest.modbus_devices.len()
    );

    let Some(role) = manifest.role else {
        error!("Manifest does not declare a Function (Transmit or Receive)");
        std::process::exit(1);
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        diodesrv::wait_for_shutdown().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    match role {
        Role::Transmit => {
            let interval = Duration::from_millis(settings.gather_interval);
            info!("Starting anode (transmit) with gather interval {interval:?}");
            anode::run(
                manifest.recorders,
                manifest.modbus_devices,
                interval,
                shutdown,
            )
            .await;
        }
        Role::Receive => {
            let password = std::env::var(DB_PASSWORD_ENV).unwrap_or_default();
            let db_config = match DbConfig::from_settings(&settings, password) {
                Ok(config) => config,
                Err(e) => {
                    // Keep receiving even without a usable database so
                    // lane problems stay observable; every write will
                    // log its own failure.
                    warn!("Database configuration incomplete: {e}");
                    DbConfig {
                        host: settings.db_url.clone(),
                        port: 1433,
                        username: settings.db_username.clone(),
                        password: String::new(),
                    }
                }
            };
            info!("Starting cathode (receive)");
            cathode::run(
                manifest.recorders,
                manifest.modbus_devices,
                Database::new(db_config),
                shutdown,
            )
            .await;
        }
    }

    info!("diodesrv stopped");
}
