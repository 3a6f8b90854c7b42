// src/stream.rs
//
// Receive-side stream abstractions fed by the ReceiveDispatcher. A
// MappedCanStream keeps the latest frame per API id (device cache); an
// AllCanStream queues everything it is handed until drained (session
// capture). Both write outbound frames through the bus transmit path.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::bus::BusTx;
use crate::error::CanResult;
use crate::frame::{CanFrame, ReceivedCanFrame};
use crate::id;

/// Send once, no periodic registration.
pub const SEND_PERIOD_NO_REPEAT: i32 = 0;
/// Cancel the periodic registration for this arbitration id instead of sending.
pub const SEND_PERIOD_STOP_REPEATING: i32 = -1;

/// Identity of the device a stream carries traffic for, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct StreamDescriptor {
    pub bus_id: u8,
    pub manufacturer: u8,
    pub device_type: u8,
    pub device_id: u8,
}

impl StreamDescriptor {
    /// Arbitration id for one of this device's messages.
    pub fn arbitration_id(&self, api_id: u16) -> u32 {
        id::encode(self.manufacturer, self.device_type, api_id, self.device_id)
    }

    /// Receive-side grouping key shared by all of this device's messages.
    pub fn filter_key(&self) -> u32 {
        id::device_filter_key(self.arbitration_id(0))
    }
}

/// Sink half of a stream. The dispatcher holds these weakly and delivers
/// every inbound frame whose filter key matches the stream's device.
pub(crate) trait FrameSink: Send + Sync {
    fn insert_new_frame(&self, api_id: u16, frame: &CanFrame, timestamp_us: u64);
}

/// Transmit half shared by both stream flavours.
pub(crate) trait CanStream: FrameSink {
    fn descriptor(&self) -> &StreamDescriptor;

    /// Encode the arbitration id and send through the bus. `period_ms > 0`
    /// registers the frame for periodic retransmission after a successful
    /// send; the stop-repeating sentinel cancels any registration and sends
    /// nothing. A failed send never registers.
    fn write_frame(&self, tx: &BusTx, frame: CanFrame, api_id: u16, period_ms: i32) -> CanResult<()> {
        let desc = self.descriptor();
        let arb_id = desc.arbitration_id(api_id);
        if period_ms == SEND_PERIOD_STOP_REPEATING {
            tx.scheduler.remove_periodic(desc.bus_id, arb_id);
            return Ok(());
        }
        tx.buses.send_frame(desc.bus_id, arb_id, &frame)?;
        if period_ms > 0 {
            tx.scheduler.add_periodic(desc.bus_id, arb_id, period_ms as u64, frame);
        }
        Ok(())
    }
}

// ============================================================================
// MappedCanStream: latest-value cache per API id
// ============================================================================

/// One cache cell: the frame, its arrival time, and whether a reader has
/// already seen it. Reads copy the cell; they never clear it.
#[derive(Debug, Clone, Copy)]
pub struct CachedFrame {
    pub frame: CanFrame,
    pub timestamp_us: u64,
    pub has_been_read: bool,
}

pub struct MappedCanStream {
    descriptor: StreamDescriptor,
    cells: Mutex<HashMap<u16, CachedFrame>>,
}

impl MappedCanStream {
    pub(crate) fn new(descriptor: StreamDescriptor) -> Self {
        MappedCanStream {
            descriptor,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Copy the cached entry for `api_id` and mark it read. The returned
    /// copy carries the pre-read flag, so a caller can tell whether it is
    /// seeing the frame for the first time. Never-populated ids and ids
    /// beyond the 10-bit range return `None`.
    pub fn read_frame(&self, api_id: u16) -> Option<CachedFrame> {
        if api_id > id::MAX_API_ID {
            return None;
        }
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.get_mut(&api_id)?;
        let copy = *cell;
        cell.has_been_read = true;
        Some(copy)
    }
}

impl FrameSink for MappedCanStream {
    fn insert_new_frame(&self, api_id: u16, frame: &CanFrame, timestamp_us: u64) {
        // Remote frames solicit data; they never replace it
        if frame.is_rtr() {
            return;
        }
        let mut cells = self.cells.lock().unwrap();
        cells.insert(
            api_id,
            CachedFrame {
                frame: *frame,
                timestamp_us,
                has_been_read: false,
            },
        );
    }
}

impl CanStream for MappedCanStream {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }
}

// ============================================================================
// AllCanStream: unbounded queue + wake event
// ============================================================================

#[derive(Debug)]
struct AllStreamState {
    frames: Vec<ReceivedCanFrame>,
    // Manual-reset data signal: set on insert, cleared only by get_frames
    has_data: bool,
}

#[derive(Debug)]
pub struct AllCanStream {
    descriptor: StreamDescriptor,
    state: Mutex<AllStreamState>,
    data_ready: Condvar,
}

impl AllCanStream {
    pub(crate) fn new(descriptor: StreamDescriptor) -> Self {
        AllCanStream {
            descriptor,
            state: Mutex::new(AllStreamState {
                frames: Vec::new(),
                has_data: false,
            }),
            data_ready: Condvar::new(),
        }
    }

    /// Swap the queue out and reset the data signal. Frames come back in
    /// arrival order; a second call with no new arrivals returns empty.
    pub fn get_frames(&self) -> Vec<ReceivedCanFrame> {
        let mut state = self.state.lock().unwrap();
        state.has_data = false;
        std::mem::take(&mut state.frames)
    }

    /// Block until the queue is non-empty or the timeout lapses. Returns
    /// whether data is waiting.
    pub fn wait_for_frames(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        let (state, _) = self
            .data_ready
            .wait_timeout_while(guard, timeout, |s| !s.has_data)
            .unwrap();
        state.has_data
    }
}

impl FrameSink for AllCanStream {
    fn insert_new_frame(&self, api_id: u16, frame: &CanFrame, timestamp_us: u64) {
        let mut state = self.state.lock().unwrap();
        state.frames.push(ReceivedCanFrame {
            api_id,
            frame: *frame,
            timestamp_us,
        });
        state.has_data = true;
        self.data_ready.notify_all();
    }
}

impl CanStream for AllCanStream {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }
}

// ============================================================================
// Tests
// ============================================================================
