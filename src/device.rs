// src/device.rs
//
// Device-level CAN API: one DeviceState per initialized device handle,
// composing a MappedCanStream cache with periodic-send bookkeeping. All
// read calls are computed against cached timestamps; nothing here blocks
// on bus I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::BusTx;
use crate::error::{CanError, CanResult};
use crate::frame::{monotonic_micros, CanFrame, ReceivedCanFrame};
use crate::stream::{
    AllCanStream, CachedFrame, CanStream, MappedCanStream, StreamDescriptor,
    SEND_PERIOD_NO_REPEAT, SEND_PERIOD_STOP_REPEATING,
};

/// One payload read off a device's latest-value cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanMessage {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
}

/// Per-handle device state. Lives in the manager's handle table; the
/// matching MappedCanStream is also held weakly by the dispatcher.
pub(crate) struct DeviceState {
    descriptor: StreamDescriptor,
    stream: Arc<MappedCanStream>,
    tx: BusTx,
    // Every apiId this handle ever registered, with its last period
    // (0 after a stop). clean() cancels them all.
    periodic_sends: Mutex<HashMap<u16, i32>>,
}

impl DeviceState {
    pub(crate) fn new(
        descriptor: StreamDescriptor,
        stream: Arc<MappedCanStream>,
        tx: BusTx,
    ) -> Self {
        DeviceState {
            descriptor,
            stream,
            tx,
            periodic_sends: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn descriptor(&self) -> StreamDescriptor {
        self.descriptor
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Single-shot classic send; payloads over 8 bytes are rejected.
    pub(crate) fn write_packet(&self, api_id: u16, data: &[u8]) -> CanResult<()> {
        let frame = CanFrame::classic(data)?;
        self.stream
            .write_frame(&self.tx, frame, api_id, SEND_PERIOD_NO_REPEAT)
    }

    /// Send once, then register (or refresh) a periodic send for `api_id`.
    /// A failed send registers nothing.
    pub(crate) fn write_packet_repeating(
        &self,
        api_id: u16,
        data: &[u8],
        period_ms: i32,
    ) -> CanResult<()> {
        if period_ms <= 0 {
            return Err(CanError::ParameterOutOfRange);
        }
        let frame = CanFrame::classic(data)?;
        self.stream.write_frame(&self.tx, frame, api_id, period_ms)?;
        self.periodic_sends.lock().unwrap().insert(api_id, period_ms);
        Ok(())
    }

    /// Single-shot remote-transmission-request frame of the given DLC.
    pub(crate) fn write_rtr_frame(&self, api_id: u16, length: u8) -> CanResult<()> {
        let frame = CanFrame::rtr(length)?;
        self.stream
            .write_frame(&self.tx, frame, api_id, SEND_PERIOD_NO_REPEAT)
    }

    /// Cancel the periodic send for `api_id`; a no-op if none is registered.
    pub(crate) fn stop_repeating(&self, api_id: u16) -> CanResult<()> {
        let frame = CanFrame::classic(&[])?;
        self.stream
            .write_frame(&self.tx, frame, api_id, SEND_PERIOD_STOP_REPEATING)?;
        self.periodic_sends.lock().unwrap().insert(api_id, 0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Cached frame for `api_id` only if it arrived since the last read.
    pub(crate) fn read_packet_new(&self, api_id: u16) -> CanResult<CanMessage> {
        match self.stream.read_frame(api_id) {
            Some(cell) if !cell.has_been_read => message_from_cell(&cell),
            _ => Err(CanError::MessageNotFound),
        }
    }

    /// Most recent cached frame regardless of read state.
    pub(crate) fn read_packet_latest(&self, api_id: u16) -> CanResult<CanMessage> {
        match self.stream.read_frame(api_id) {
            Some(cell) => message_from_cell(&cell),
            None => Err(CanError::MessageNotFound),
        }
    }

    /// As latest, but a frame older than `timeout_ms` is a Timeout.
    pub(crate) fn read_packet_timeout(&self, api_id: u16, timeout_ms: u32) -> CanResult<CanMessage> {
        let cell = self
            .stream
            .read_frame(api_id)
            .ok_or(CanError::MessageNotFound)?;
        let message = message_from_cell(&cell)?;
        if age_micros(&cell) > timeout_ms as u64 * 1000 {
            return Err(CanError::Timeout);
        }
        Ok(message)
    }

    /// A frame younger than `period_ms` is still fresh from its periodic
    /// cadence and returned immediately; anything older falls back to the
    /// timeout-checked read.
    pub(crate) fn read_periodic_packet(
        &self,
        api_id: u16,
        timeout_ms: u32,
        period_ms: u32,
    ) -> CanResult<CanMessage> {
        let cell = self
            .stream
            .read_frame(api_id)
            .ok_or(CanError::MessageNotFound)?;
        let message = message_from_cell(&cell)?;
        let age_us = age_micros(&cell);
        if age_us < period_ms as u64 * 1000 {
            return Ok(message);
        }
        if age_us > timeout_ms as u64 * 1000 {
            return Err(CanError::Timeout);
        }
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Cancel every periodic send this handle ever registered. Called by
    /// the manager when the handle is freed.
    pub(crate) fn clean(&self) {
        let api_ids: Vec<u16> = self
            .periodic_sends
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();
        for api_id in api_ids {
            let _ = self.stop_repeating(api_id);
        }
    }
}

fn age_micros(cell: &CachedFrame) -> u64 {
    monotonic_micros().saturating_sub(cell.timestamp_us)
}

/// Classic read calls never hand back an FD payload; an FD frame in the
/// cache is IncompatibleState, not a truncated read.
fn message_from_cell(cell: &CachedFrame) -> CanResult<CanMessage> {
    if cell.frame.is_fd() {
        return Err(CanError::IncompatibleState);
    }
    Ok(CanMessage {
        data: cell.frame.data().to_vec(),
        timestamp_us: cell.timestamp_us,
    })
}

// ============================================================================
// CanStreamSession
// ============================================================================

/// An open capture session for one of a device's API ids, backed by an
/// AllCanStream the dispatcher feeds. Dropping the session releases the
/// stream; its dispatcher slot is reclaimed at a later registration.
#[derive(Debug)]
pub struct CanStreamSession {
    stream: Arc<AllCanStream>,
    api_id: u16,
    max_frames: usize,
    // Frames drained from the stream but beyond the per-read cap
    leftovers: Mutex<VecDeque<ReceivedCanFrame>>,
}

impl CanStreamSession {
    pub(crate) fn new(stream: Arc<AllCanStream>, api_id: u16, max_frames: usize) -> Self {
        CanStreamSession {
            stream,
            api_id,
            max_frames,
            leftovers: Mutex::new(VecDeque::new()),
        }
    }

    pub fn api_id(&self) -> u16 {
        self.api_id
    }

    /// Drain up to `max_frames` captured frames in arrival order. Frames
    /// over the cap stay queued for the next call; frames for other API
    /// ids of the same device are discarded.
    pub fn read(&self) -> Vec<ReceivedCanFrame> {
        let mut leftovers = self.leftovers.lock().unwrap();
        for received in self.stream.get_frames() {
            if received.api_id == self.api_id {
                leftovers.push_back(received);
            }
        }
        let take = leftovers.len().min(self.max_frames);
        leftovers.drain(..take).collect()
    }

    /// Block until capture activity occurs or the timeout lapses. A true
    /// return means `read()` may have frames; false means nothing arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.leftovers.lock().unwrap().is_empty() {
            return true;
        }
        self.stream.wait_for_frames(timeout)
    }
}

// ============================================================================
// Tests
// ============================================================================
