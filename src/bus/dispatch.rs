// src/bus/dispatch.rs
//
// Receive-side demultiplexer. Inbound frames are routed by device filter
// key to every live stream subscribed for that device. Subscriptions are
// weak: the dispatcher never keeps a stream alive, and expired entries are
// reclaimed at the next registration, never on the dispatch path.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::bus::NUM_CAN_BUSES;
use crate::frame::CanFrame;
use crate::id;
use crate::stream::FrameSink;

pub(crate) struct ReceiveDispatcher {
    // One subscription table per bus, keyed by device filter key
    tables: Vec<Mutex<HashMap<u32, Vec<Weak<dyn FrameSink>>>>>,
}

impl ReceiveDispatcher {
    pub(crate) fn new() -> Self {
        ReceiveDispatcher {
            tables: (0..NUM_CAN_BUSES)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// Subscribe a stream for every frame matching `filter_key`. An expired
    /// slot in the bucket is reused in place; the bucket only grows when all
    /// existing slots are live, bounding growth under handle churn.
    pub(crate) fn register_stream(&self, bus_id: u8, filter_key: u32, stream: Weak<dyn FrameSink>) {
        let table = match self.tables.get(bus_id as usize) {
            Some(table) => table,
            None => return,
        };
        let mut table = table.lock().unwrap();
        let bucket = table.entry(filter_key).or_default();
        match bucket.iter_mut().find(|slot| slot.strong_count() == 0) {
            Some(slot) => *slot = stream,
            None => bucket.push(stream),
        }
    }

    /// Deliver one inbound frame to every live subscriber for its device.
    /// Dead entries are skipped, not removed: this path stays allocation
    /// free at O(live + dead) per frame.
    pub(crate) fn dispatch(&self, bus_id: u8, arb_id: u32, frame: &CanFrame, timestamp_us: u64) {
        let filter_key = id::device_filter_key(arb_id);
        let api_id = id::api_id_of(arb_id);
        let table = match self.tables.get(bus_id as usize) {
            Some(table) => table,
            None => return,
        };
        let table = table.lock().unwrap();
        if let Some(bucket) = table.get(&filter_key) {
            for weak in bucket {
                if let Some(stream) = weak.upgrade() {
                    stream.insert_new_frame(api_id, frame, timestamp_us);
                }
            }
        }
    }

    #[cfg(test)]
    fn bucket_len(&self, bus_id: u8, filter_key: u32) -> usize {
        self.tables[bus_id as usize]
            .lock()
            .unwrap()
            .get(&filter_key)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CanDeviceType, CanManufacturer};
    use crate::stream::{MappedCanStream, StreamDescriptor};
    use std::sync::Arc;

    fn descriptor(device_id: u8) -> StreamDescriptor {
        StreamDescriptor {
            bus_id: 0,
            manufacturer: CanManufacturer::Ctre.into(),
            device_type: CanDeviceType::Pneumatics.into(),
            device_id,
        }
    }

    fn subscribe(dispatcher: &ReceiveDispatcher, stream: &Arc<MappedCanStream>, key: u32) {
        let weak = Arc::downgrade(stream) as Weak<dyn FrameSink>;
        dispatcher.register_stream(0, key, weak);
    }

    #[test]
    fn test_dispatch_reaches_matching_streams_only() {
        let dispatcher = ReceiveDispatcher::new();
        let matching_a = Arc::new(MappedCanStream::new(descriptor(3)));
        let matching_b = Arc::new(MappedCanStream::new(descriptor(3)));
        let other = Arc::new(MappedCanStream::new(descriptor(4)));
        subscribe(&dispatcher, &matching_a, descriptor(3).filter_key());
        subscribe(&dispatcher, &matching_b, descriptor(3).filter_key());
        subscribe(&dispatcher, &other, descriptor(4).filter_key());

        let arb_id = descriptor(3).arbitration_id(0x50);
        let frame = CanFrame::classic(&[1, 2, 3]).unwrap();
        dispatcher.dispatch(0, arb_id, &frame, 500);

        assert!(matching_a.read_frame(0x50).is_some());
        assert!(matching_b.read_frame(0x50).is_some());
        assert!(other.read_frame(0x50).is_none());
    }

    #[test]
    fn test_registration_reuses_expired_slots() {
        let dispatcher = ReceiveDispatcher::new();
        let key = descriptor(3).filter_key();

        let first = Arc::new(MappedCanStream::new(descriptor(3)));
        subscribe(&dispatcher, &first, key);
        assert_eq!(dispatcher.bucket_len(0, key), 1);
        drop(first);

        // The dead slot is reclaimed instead of growing the bucket
        let second = Arc::new(MappedCanStream::new(descriptor(3)));
        subscribe(&dispatcher, &second, key);
        assert_eq!(dispatcher.bucket_len(0, key), 1);

        // A second live registration has no slot to reuse
        let third = Arc::new(MappedCanStream::new(descriptor(3)));
        subscribe(&dispatcher, &third, key);
        assert_eq!(dispatcher.bucket_len(0, key), 2);
    }

    #[test]
    fn test_dispatch_leaves_dead_entries_in_place() {
        let dispatcher = ReceiveDispatcher::new();
        let key = descriptor(3).filter_key();
        let gone = Arc::new(MappedCanStream::new(descriptor(3)));
        subscribe(&dispatcher, &gone, key);
        drop(gone);

        let frame = CanFrame::classic(&[9]).unwrap();
        dispatcher.dispatch(0, descriptor(3).arbitration_id(0x10), &frame, 100);
        // Dead entry survives dispatch untouched
        assert_eq!(dispatcher.bucket_len(0, key), 1);
    }

    #[test]
    fn test_dispatch_unknown_device_is_noop() {
        let dispatcher = ReceiveDispatcher::new();
        let frame = CanFrame::classic(&[9]).unwrap();
        dispatcher.dispatch(0, descriptor(9).arbitration_id(0x10), &frame, 100);
        dispatcher.dispatch(7, descriptor(9).arbitration_id(0x10), &frame, 100);
    }
}
