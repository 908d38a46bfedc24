//! Logging setup.
//!
//! Console output goes through a standard `tracing_subscriber` fmt layer
//! filtered by `RUST_LOG` (or the configured default level). Severe
//! failures additionally land in `./logfile.txt`, one date-prefixed line
//! per event, so operators of an air-gapped box have a plain-text trail
//! without a log shipper.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default location of the severe-event log file.
pub const SEVERE_LOG_FILE: &str = "./logfile.txt";

/// Initialize the logging system.
///
/// `level` is used when `RUST_LOG` is not set. Severe (ERROR) events are
/// appended to `severe_log` in addition to normal console output.
pub fn init(level: &str, severe_log: impl Into<PathBuf>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(SevereFileLayer::new(severe_log))
        .init();
}

/// Layer that appends ERROR-level events to a plain text file.
pub struct SevereFileLayer {
    path: PathBuf,
    // File handle is opened per write so a deleted/rotated file heals itself;
    // the mutex keeps concurrent task writes line-atomic.
    lock: Mutex<()>,
}

impl SevereFileLayer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, line: &str) {
        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(file, "{line}");
        }
    }
}

impl<S: Subscriber> Layer<S> for SevereFileLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let stamp = chrono::Local::now().format("%a %b %d %H:%M:%S %Y");
        self.append(&format!("{stamp}: {}", visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_events_are_appended_with_date_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logfile.txt");

        let subscriber =
            tracing_subscriber::registry().with(SevereFileLayer::new(path.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("serial port /dev/ttyS0 failed to open");
            tracing::info!("this line must not be persisted");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("serial port /dev/ttyS0 failed to open"));
        // date prefix ends with ": " before the message
        assert!(lines[0].contains(": serial"));
    }
}
