//! Priority lanes: the three FIFO queues between polling and the diode.
//!
//! One lane per serial link. Producers are the device adapters (bound
//! to a lane by configured priority), the single consumer per lane is
//! its serial sender on the transmit side or the dispatcher feed on the
//! receive side. Enqueue order equals dequeue order within a lane;
//! there is no ordering across lanes, which is the point — a verbose
//! low-priority device can only ever back up its own link.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::codec::DataTable;

/// Number of priority lanes (= number of serial links).
pub const LANE_COUNT: usize = 3;

/// Producer half of the three lanes.
#[derive(Clone)]
pub struct LaneSenders {
    senders: [UnboundedSender<DataTable>; LANE_COUNT],
}

impl LaneSenders {
    /// Enqueue a record on the lane for `priority` (1..=3). Out-of-range
    /// values land on lane 3, matching device construction. A send to a
    /// lane whose consumer is gone drops the record silently — the
    /// consumer already logged why it stopped.
    pub fn send(&self, priority: u8, table: DataTable) {
        let index = lane_index(priority);
        let _ = self.senders[index].send(table);
    }
}

/// Consumer half of the three lanes.
pub struct LaneReceivers {
    pub lanes: [UnboundedReceiver<DataTable>; LANE_COUNT],
}

/// Map a configured priority to a lane array index.
pub fn lane_index(priority: u8) -> usize {
    match priority {
        1..=3 => priority as usize - 1,
        _ => LANE_COUNT - 1,
    }
}

/// Create the three lanes.
pub fn lanes() -> (LaneSenders, LaneReceivers) {
    let (tx1, rx1) = mpsc::unbounded_channel();
    let (tx2, rx2) = mpsc::unbounded_channel();
    let (tx3, rx3) = mpsc::unbounded_channel();
    (
        LaneSenders {
            senders: [tx1, tx2, tx3],
        },
        LaneReceivers {
            lanes: [rx1, rx2, rx3],
        },
    )
}
