// src/bus/write_loop.rs
//
// The write loop: a dedicated thread hosting a current-thread tokio
// runtime. Every periodic-send mutation happens on this loop, posted in
// through an unbounded channel, so the scheduler table needs no lock.
// Timer-driven sends go out from here under each bus's write lock;
// one-shot sends from caller threads take the same lock directly.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bus::scheduler::{PeriodicSendTable, SchedulerSnapshot};
use crate::bus::BusSet;
use crate::frame::CanFrame;

/// Write-loop thread priority, below the read loop so inbound traffic wins.
const WRITE_LOOP_PRIORITY: i32 = 30;

/// Requests posted into the write loop. Each mutating request carries a
/// rendezvous channel so the caller observes completion before returning.
pub(crate) enum WriteRequest {
    AddPeriodic {
        bus_id: u8,
        arb_id: u32,
        period_ms: u64,
        frame: CanFrame,
        done: std_mpsc::SyncSender<()>,
    },
    RemovePeriodic {
        bus_id: u8,
        arb_id: u32,
        done: std_mpsc::SyncSender<()>,
    },
    Snapshot {
        reply: std_mpsc::SyncSender<SchedulerSnapshot>,
    },
    Shutdown,
}

/// Cloneable posting side of the write loop.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl SchedulerHandle {
    /// Register (or refresh) a periodic send. Blocks until the loop has
    /// applied the registration. After shutdown this becomes a no-op.
    pub(crate) fn add_periodic(&self, bus_id: u8, arb_id: u32, period_ms: u64, frame: CanFrame) {
        let (done, done_rx) = std_mpsc::sync_channel(1);
        let request = WriteRequest::AddPeriodic {
            bus_id,
            arb_id,
            period_ms,
            frame,
            done,
        };
        if self.tx.send(request).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Cancel a periodic send; idempotent. Blocks until applied.
    pub(crate) fn remove_periodic(&self, bus_id: u8, arb_id: u32) {
        let (done, done_rx) = std_mpsc::sync_channel(1);
        let request = WriteRequest::RemovePeriodic {
            bus_id,
            arb_id,
            done,
        };
        if self.tx.send(request).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Current periodic-send table contents.
    pub(crate) fn snapshot(&self) -> SchedulerSnapshot {
        let (reply, reply_rx) = std_mpsc::sync_channel(1);
        if self.tx.send(WriteRequest::Snapshot { reply }).is_ok() {
            reply_rx.recv().unwrap_or_default()
        } else {
            SchedulerSnapshot::default()
        }
    }
}

/// Owning side of the write loop; joins the thread on shutdown.
pub(crate) struct WriteLoopHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WriteLoopHandle {
    pub(crate) fn scheduler(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(WriteRequest::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for WriteLoopHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the write loop over the given buses.
pub(crate) fn spawn(buses: Arc<BusSet>, realtime_priority: bool) -> WriteLoopHandle {
    let (tx, rx) = mpsc::unbounded_channel::<WriteRequest>();

    let thread = std::thread::spawn(move || {
        if realtime_priority {
            crate::bus::try_set_realtime_priority("write-loop", WRITE_LOOP_PRIORITY);
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        rt.block_on(run_loop(buses, rx));
    });

    WriteLoopHandle {
        tx,
        thread: Some(thread),
    }
}

async fn run_loop(buses: Arc<BusSet>, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    let mut table = PeriodicSendTable::new();
    tlog!("[write-loop] Started");

    loop {
        let deadline = table.next_deadline();

        tokio::select! {
            request = rx.recv() => {
                match request {
                    Some(WriteRequest::AddPeriodic { bus_id, arb_id, period_ms, frame, done }) => {
                        table.add(bus_id, arb_id, period_ms, frame, Instant::now());
                        let _ = done.try_send(());
                    }
                    Some(WriteRequest::RemovePeriodic { bus_id, arb_id, done }) => {
                        table.remove(bus_id, arb_id);
                        let _ = done.try_send(());
                    }
                    Some(WriteRequest::Snapshot { reply }) => {
                        let _ = reply.try_send(table.snapshot());
                    }
                    Some(WriteRequest::Shutdown) | None => {
                        // Channel closed or explicit stop
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                for due in table.collect_due(Instant::now()) {
                    if let Err(e) = buses.send_frame(due.bus_id, due.arb_id, &due.frame) {
                        tlog!(
                            "[write-loop] Periodic send failed on bus {} id 0x{:08X}: {}",
                            due.bus_id,
                            due.arb_id,
                            e
                        );
                    }
                }
            }
        }
    }

    tlog!("[write-loop] Stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CanConfig;

    fn offline_buses() -> Arc<BusSet> {
        // No such interfaces exist; buses come up unusable but the loop
        // machinery is fully exercised
        let config = CanConfig {
            interface_prefix: "nosuchcan".to_string(),
            realtime_priority: false,
            ..CanConfig::default()
        };
        Arc::new(BusSet::open_all(&config))
    }

    #[test]
    fn test_requests_apply_in_order() {
        let mut handle = spawn(offline_buses(), false);
        let scheduler = handle.scheduler();
        let frame = CanFrame::classic(&[1, 2, 3]).unwrap();

        scheduler.add_periodic(0, 0x1234, 500, frame);
        scheduler.add_periodic(0, 0x1235, 500, frame);
        let snap = scheduler.snapshot();
        assert_eq!(snap.buckets.len(), 1);
        assert_eq!(snap.buckets[0].ref_count, 2);

        scheduler.remove_periodic(0, 0x1234);
        scheduler.remove_periodic(0, 0x1235);
        assert!(scheduler.snapshot().buckets.is_empty());

        handle.shutdown();
    }

    #[test]
    fn test_remove_without_add_is_noop() {
        let mut handle = spawn(offline_buses(), false);
        let scheduler = handle.scheduler();
        scheduler.remove_periodic(0, 0x999);
        assert!(scheduler.snapshot().buckets.is_empty());
        handle.shutdown();
    }

    #[test]
    fn test_shutdown_then_requests_noop() {
        let mut handle = spawn(offline_buses(), false);
        let scheduler = handle.scheduler();
        handle.shutdown();
        // Loop is gone; posting must not block or panic
        scheduler.add_periodic(0, 0x1, 100, CanFrame::classic(&[0]).unwrap());
        assert!(scheduler.snapshot().buckets.is_empty());
    }
}
