//! Cathode: the receive side of the diode.
//!
//! Three receiver tasks read length-delimited records off their serial
//! link into their lane; one dispatcher drains the lanes in fixed order
//! and routes each record to the owning device adapter, which writes it
//! into the database. Database calls are single-threaded by
//! construction — only the dispatcher touches the connection.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::codec::{DataTable, DeviceType};
use crate::db::Database;
use crate::devices::{ModbusDevice, Recorder};
use crate::runtime::lanes::{lanes, LaneReceivers, LaneSenders, LANE_COUNT};
use crate::transport::serial::{open_port, read_frame, SERIAL_PORTS};

/// Dispatcher idle pause when all lanes are empty.
const DISPATCH_TICK: Duration = Duration::from_millis(10);

/// Pause after a framing error before trying the next prefix.
const RESYNC_PAUSE: Duration = Duration::from_millis(50);

/// Run the receive side until `shutdown` fires.
pub async fn run(
    recorders: Vec<Recorder>,
    devices: Vec<ModbusDevice>,
    db: Database,
    shutdown: CancellationToken,
) {
    let (senders, receivers) = lanes();

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for lane in 0..LANE_COUNT {
        tasks.push(tokio::spawn(receiver_task(
            lane,
            senders.clone(),
            shutdown.clone(),
        )));
    }

    dispatch_loop(recorders, devices, db, receivers, shutdown).await;

    for task in tasks {
        let _ = task.await;
    }
}

/// Read complete records off one serial link into its lane. A record
/// that cannot be framed or decoded is logged and discarded; reading
/// resumes at the next length prefix.
async fn receiver_task(lane: usize, senders: LaneSenders, shutdown: CancellationToken) {
    let path = SERIAL_PORTS[lane];
    let mut port = match open_port(path) {
        Ok(port) => {
            info!("Serial port {path} is open.");
            port
        }
        Err(e) => {
            error!("Unable to create serial communications on {path}: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = read_frame(&mut port) => match result {
                Ok(table) => senders.send(lane as u8 + 1, table),
                Err(e) => {
                    error!("Unable to deserialize data on {path}: {e}");
                    sleep(RESYNC_PAUSE).await;
                }
            }
        }
    }
    info!("Serial port {path} is closed.");
}

/// Drain the lanes in fixed order 1, 2, 3 and route each record to the
/// device that produced it on the far side.
async fn dispatch_loop(
    mut recorders: Vec<Recorder>,
    mut devices: Vec<ModbusDevice>,
    mut db: Database,
    mut receivers: LaneReceivers,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let mut idle = true;
        for lane in 0..LANE_COUNT {
            if let Ok(table) = receivers.lanes[lane].try_recv() {
                idle = false;
                dispatch_record(&mut recorders, &mut devices, &mut db, table).await;
            }
        }
        if idle {
            sleep(DISPATCH_TICK).await;
        }
    }
    db.close().await;
    info!("Dispatcher stopped, database connection closed");
}

/// Route one record by origin type and manifest index.
async fn dispatch_record(
    recorders: &mut [Recorder],
    devices: &mut [ModbusDevice],
    db: &mut Database,
    table: DataTable,
) {
    match table.device_type {
        DeviceType::Recorder => match recorders.get_mut(table.device_id as usize) {
            Some(recorder) => recorder.update_database(db, &table).await,
            None => error!("Received record for unknown recorder ID {}", table.device_id),
        },
        DeviceType::ModbusDevice => match devices.get_mut(table.device_id as usize) {
            Some(device) => device.update_database(db, &table).await,
            None => error!(
                "Received record for unknown Modbus device ID {}",
                table.device_id
            ),
        },
    }
}
