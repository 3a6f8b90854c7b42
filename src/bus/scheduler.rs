// src/bus/scheduler.rs
//
// Periodic-send bookkeeping: (bus, arbId) -> period keys and shared
// per-period timer buckets. Owned and mutated exclusively by the write
// loop, so none of this state carries a lock. Each bucket holds one
// last-frame slot per bus; registrations sharing a period share the
// bucket and its deadline.

use std::collections::HashMap;

use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::bus::NUM_CAN_BUSES;
use crate::frame::CanFrame;

/// A frame parked in a bucket slot for retransmission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeriodicFrame {
    pub(crate) arb_id: u32,
    pub(crate) frame: CanFrame,
}

/// A frame due for transmission on this tick.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DueFrame {
    pub(crate) bus_id: u8,
    pub(crate) arb_id: u32,
    pub(crate) frame: CanFrame,
}

struct PeriodBucket {
    // Number of distinct (bus, arbId) keys attached to this period
    ref_count: usize,
    next_fire: Instant,
    slots: [Option<PeriodicFrame>; NUM_CAN_BUSES],
}

/// Diagnostics view of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodicBucketInfo {
    pub period_ms: u64,
    pub ref_count: usize,
    /// (bus, arbitration id) currently parked in each populated slot.
    pub slots: Vec<(u8, u32)>,
}

/// Diagnostics view of the whole periodic-send table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerSnapshot {
    pub buckets: Vec<PeriodicBucketInfo>,
}

#[derive(Default)]
pub(crate) struct PeriodicSendTable {
    key_to_period: HashMap<(u8, u32), u64>,
    buckets: HashMap<u64, PeriodBucket>,
}

impl PeriodicSendTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Upsert a periodic registration. Re-registering a key at its current
    /// period only refreshes the parked frame; a changed period moves the
    /// key between buckets. A 0 -> 1 bucket transition arms the deadline
    /// one full period out, matching a fresh recurring timer.
    pub(crate) fn add(&mut self, bus_id: u8, arb_id: u32, period_ms: u64, frame: CanFrame, now: Instant) {
        let key = (bus_id, arb_id);
        if let Some(&existing) = self.key_to_period.get(&key) {
            if existing == period_ms {
                if let Some(bucket) = self.buckets.get_mut(&period_ms) {
                    bucket.slots[bus_id as usize] = Some(PeriodicFrame { arb_id, frame });
                }
                return;
            }
            // Period changed: detach from the old bucket first
            self.remove(bus_id, arb_id);
        }

        self.key_to_period.insert(key, period_ms);
        let bucket = self.buckets.entry(period_ms).or_insert_with(|| PeriodBucket {
            ref_count: 0,
            next_fire: now + Duration::from_millis(period_ms),
            slots: [None; NUM_CAN_BUSES],
        });
        bucket.slots[bus_id as usize] = Some(PeriodicFrame { arb_id, frame });
        bucket.ref_count += 1;
    }

    /// Remove a registration. Absent keys are a no-op. Clears the bucket's
    /// frame slot for the bus and drops the bucket outright when its last
    /// key detaches, so a zero count never leaves a live deadline behind.
    pub(crate) fn remove(&mut self, bus_id: u8, arb_id: u32) {
        let period_ms = match self.key_to_period.remove(&(bus_id, arb_id)) {
            Some(period_ms) => period_ms,
            None => return,
        };
        if let Some(bucket) = self.buckets.get_mut(&period_ms) {
            bucket.slots[bus_id as usize] = None;
            bucket.ref_count -= 1;
            if bucket.ref_count == 0 {
                self.buckets.remove(&period_ms);
            }
        }
    }

    /// Earliest bucket deadline, if any bucket is live.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.buckets.values().map(|b| b.next_fire).min()
    }

    /// Collect every frame whose bucket deadline has passed and advance
    /// those deadlines by one period. A loop stall longer than the period
    /// re-arms from now rather than bursting missed ticks.
    pub(crate) fn collect_due(&mut self, now: Instant) -> Vec<DueFrame> {
        let mut due = Vec::new();
        for (&period_ms, bucket) in self.buckets.iter_mut() {
            if bucket.next_fire > now {
                continue;
            }
            bucket.next_fire += Duration::from_millis(period_ms);
            if bucket.next_fire <= now {
                bucket.next_fire = now + Duration::from_millis(period_ms);
            }
            for (bus, slot) in bucket.slots.iter().enumerate() {
                if let Some(parked) = slot {
                    due.push(DueFrame {
                        bus_id: bus as u8,
                        arb_id: parked.arb_id,
                        frame: parked.frame,
                    });
                }
            }
        }
        due
    }

    pub(crate) fn snapshot(&self) -> SchedulerSnapshot {
        let mut buckets: Vec<PeriodicBucketInfo> = self
            .buckets
            .iter()
            .map(|(&period_ms, bucket)| PeriodicBucketInfo {
                period_ms,
                ref_count: bucket.ref_count,
                slots: bucket
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(bus, slot)| slot.map(|s| (bus as u8, s.arb_id)))
                    .collect(),
            })
            .collect();
        buckets.sort_by_key(|b| b.period_ms);
        SchedulerSnapshot { buckets }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id;

    fn frame(byte: u8) -> CanFrame {
        CanFrame::classic(&[byte]).unwrap()
    }

    #[test]
    fn test_add_creates_one_bucket() {
        let mut table = PeriodicSendTable::new();
        let now = Instant::now();
        let arb = id::encode(4, 9, 0x50, 3);
        table.add(0, arb, 20, frame(1), now);

        let snap = table.snapshot();
        assert_eq!(snap.buckets.len(), 1);
        assert_eq!(snap.buckets[0].period_ms, 20);
        assert_eq!(snap.buckets[0].ref_count, 1);
        assert_eq!(snap.buckets[0].slots, vec![(0, arb)]);
    }

    #[test]
    fn test_readd_same_period_replaces_not_duplicates() {
        let mut table = PeriodicSendTable::new();
        let now = Instant::now();
        table.add(0, 0x100, 20, frame(1), now);
        table.add(0, 0x100, 20, frame(2), now);

        let snap = table.snapshot();
        assert_eq!(snap.buckets[0].ref_count, 1);
        let due = table.collect_due(now + Duration::from_millis(25));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].frame.data(), &[2]);
    }

    #[test]
    fn test_readd_new_period_moves_key() {
        let mut table = PeriodicSendTable::new();
        let now = Instant::now();
        table.add(0, 0x100, 20, frame(1), now);
        table.add(0, 0x100, 50, frame(1), now);

        let snap = table.snapshot();
        assert_eq!(snap.buckets.len(), 1);
        assert_eq!(snap.buckets[0].period_ms, 50);
        assert_eq!(snap.buckets[0].ref_count, 1);
    }

    #[test]
    fn test_remove_is_idempotent_and_count_never_negative() {
        let mut table = PeriodicSendTable::new();
        let now = Instant::now();
        // Removing an unknown key is a no-op
        table.remove(0, 0x200);
        assert!(table.is_empty());

        table.add(0, 0x200, 10, frame(1), now);
        table.remove(0, 0x200);
        assert!(table.is_empty());
        assert!(table.next_deadline().is_none());
        // A second remove after the bucket is gone is still a no-op
        table.remove(0, 0x200);
        assert!(table.is_empty());
    }

    #[test]
    fn test_shared_bucket_refcounts() {
        let mut table = PeriodicSendTable::new();
        let now = Instant::now();
        table.add(0, 0x100, 20, frame(1), now);
        let before = table.snapshot().buckets[0].ref_count;
        table.add(0, 0x101, 20, frame(2), now);
        assert_eq!(table.snapshot().buckets[0].ref_count, before + 1);
        table.remove(0, 0x101);
        assert_eq!(table.snapshot().buckets[0].ref_count, before);
    }

    #[test]
    fn test_collect_due_respects_deadline() {
        let mut table = PeriodicSendTable::new();
        let now = Instant::now();
        table.add(0, 0x100, 20, frame(7), now);

        // First fire is one full period out
        assert!(table.collect_due(now + Duration::from_millis(5)).is_empty());
        let due = table.collect_due(now + Duration::from_millis(21));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].arb_id, 0x100);
        // Deadline advanced: nothing due again until another period passes
        assert!(table.collect_due(now + Duration::from_millis(22)).is_empty());
        assert_eq!(table.collect_due(now + Duration::from_millis(41)).len(), 1);
    }

    #[test]
    fn test_stalled_collect_rearms_without_burst() {
        let mut table = PeriodicSendTable::new();
        let now = Instant::now();
        table.add(0, 0x100, 10, frame(7), now);

        // 95ms late: one send, then re-armed relative to now
        let late = now + Duration::from_millis(105);
        assert_eq!(table.collect_due(late).len(), 1);
        assert!(table.collect_due(late + Duration::from_millis(5)).is_empty());
        assert_eq!(table.collect_due(late + Duration::from_millis(11)).len(), 1);
    }
}
