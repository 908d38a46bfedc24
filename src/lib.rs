//! Data-diode sensor bridge.
//!
//! Two process roles share this crate: the transmit side (anode) polls
//! Modbus recorders and devices and writes self-describing records onto
//! three outbound serial links; the receive side (cathode) reads the
//! links back into records and persists them into an MS-SQL historian.
//! The diode between them is physically one-way, so both sides derive
//! identical device metadata from the same configuration files and only
//! numeric payloads cross the link.

pub mod codec;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod logging;
pub mod protocols;
pub mod runtime;
pub mod settings;
pub mod transport;

pub use config::{load_manifest, Manifest, Role};
pub use error::{DiodeError, Result};
pub use settings::Settings;

use tracing::error;

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix).
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!(
                    "Failed to install SIGTERM handler: {e}. Service will only respond to Ctrl+C"
                );
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
