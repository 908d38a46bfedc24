//! Anode: the transmit side of the diode.
//!
//! Four tasks: one poll scheduler sweeping every device at the
//! configured gather interval, and three serial senders each draining
//! one priority lane onto one link. The scheduler gates on
//! `now - last >= interval` rather than a timer so a sweep that runs
//! long never accumulates drift; between checks it yields to the
//! runtime instead of hard-spinning.

use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::codec::DataTable;
use crate::devices::{ModbusDevice, Recorder};
use crate::runtime::lanes::{lanes, LaneSenders};
use crate::transport::serial::{open_port, write_frame, SERIAL_PORTS};

/// Pause between frames on a serial link.
const SEND_PACING: Duration = Duration::from_millis(50);

/// Idle granularity of the poll scheduler's clock gate.
const POLL_TICK: Duration = Duration::from_millis(10);

/// Run the transmit side until `shutdown` fires. Consumes the device
/// lists; connections are closed on the way out.
pub async fn run(
    recorders: Vec<Recorder>,
    devices: Vec<ModbusDevice>,
    gather_interval: Duration,
    shutdown: CancellationToken,
) {
    let (senders, receivers) = lanes();

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for (lane, rx) in receivers.lanes.into_iter().enumerate() {
        tasks.push(tokio::spawn(sender_task(lane, rx, shutdown.clone())));
    }

    poll_loop(recorders, devices, gather_interval, senders, shutdown).await;

    for task in tasks {
        let _ = task.await;
    }
}

/// Sweep every device in manifest order whenever the gather interval
/// has elapsed, enqueueing each produced record on its priority lane.
async fn poll_loop(
    mut recorders: Vec<Recorder>,
    mut devices: Vec<ModbusDevice>,
    interval: Duration,
    senders: LaneSenders,
    shutdown: CancellationToken,
) {
    let mut last_poll = Instant::now();
    while !shutdown.is_cancelled() {
        if last_poll.elapsed() >= interval {
            last_poll = Instant::now();
            for recorder in recorders.iter_mut() {
                if let Some(table) = recorder.poll().await {
                    senders.send(recorder.priority(), table);
                }
            }
            for device in devices.iter_mut() {
                if let Some(table) = device.poll().await {
                    senders.send(device.priority(), table);
                }
            }
        }
        sleep(POLL_TICK).await;
    }

    for recorder in recorders.iter_mut() {
        recorder.close().await;
    }
    for device in devices.iter_mut() {
        device.close().await;
    }
    info!("Poll scheduler stopped, device connections closed");
}

/// Drain one lane onto one serial link. A failed write drops the
/// record — the diode has no way to recover it anyway. If the port
/// cannot be opened at startup the lane runs in discard mode so the
/// other links keep working.
async fn sender_task(
    lane: usize,
    mut rx: UnboundedReceiver<DataTable>,
    shutdown: CancellationToken,
) {
    let path = SERIAL_PORTS[lane];
    let mut port = match open_port(path) {
        Ok(port) => {
            info!("Serial port {path} is open.");
            port
        }
        Err(e) => {
            error!("Unable to create serial communications on {path}: {e}");
            discard_lane(rx, shutdown).await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(table) => {
                    if let Err(e) = write_frame(&mut port, &table).await {
                        error!("Unable to send data on serial port {path}: {e}");
                    }
                    sleep(SEND_PACING).await;
                }
                None => break,
            }
        }
    }
    info!("Serial port {path} is closed.");
}

/// Keep a dead lane's queue from growing without bound.
async fn discard_lane(mut rx: UnboundedReceiver<DataTable>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => {
                if received.is_none() {
                    break;
                }
            }
        }
    }
}
