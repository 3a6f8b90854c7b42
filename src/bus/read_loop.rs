// src/bus/read_loop.rs
//
// The read loop: a dedicated thread blocked in poll(2) across every usable
// bus socket. Frames are timestamped as they come off the socket and fanned
// out through the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::dispatch::ReceiveDispatcher;
use crate::bus::BusSet;

/// Read-loop thread priority, above the write loop so inbound traffic wins.
const READ_LOOP_PRIORITY: i32 = 50;

/// Owning side of the read loop; joins the thread on shutdown.
pub(crate) struct ReadLoopHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ReadLoopHandle {
    pub(crate) fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReadLoopHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the read loop over the given buses. `poll_timeout_ms` bounds how
/// long shutdown can lag behind the stop flag.
pub(crate) fn spawn(
    buses: Arc<BusSet>,
    dispatcher: Arc<ReceiveDispatcher>,
    poll_timeout_ms: u64,
    realtime_priority: bool,
) -> ReadLoopHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = std::thread::spawn(move || {
        if realtime_priority {
            crate::bus::try_set_realtime_priority("read-loop", READ_LOOP_PRIORITY);
        }
        run_loop(buses, dispatcher, poll_timeout_ms, stop_flag);
    });

    ReadLoopHandle {
        stop,
        thread: Some(thread),
    }
}

#[cfg(target_os = "linux")]
fn run_loop(
    buses: Arc<BusSet>,
    dispatcher: Arc<ReceiveDispatcher>,
    poll_timeout_ms: u64,
    stop: Arc<AtomicBool>,
) {
    // Bus ids with an open socket, in pollfd order
    let mut poll_buses: Vec<u8> = Vec::new();
    let mut fds: Vec<libc::pollfd> = Vec::new();
    for bus in buses.iter() {
        if let Some(fd) = bus.raw_fd() {
            poll_buses.push(bus.index());
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
    }
    tlog!("[read-loop] Started with {} pollable bus(es)", fds.len());

    let timeout = poll_timeout_ms.min(i32::MAX as u64) as i32;
    while !stop.load(Ordering::Relaxed) {
        if fds.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(poll_timeout_ms));
            continue;
        }

        for fd in fds.iter_mut() {
            fd.revents = 0;
        }
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tlog!("[read-loop] poll failed: {} - stopping", e);
            break;
        }
        if ready == 0 {
            continue;
        }

        let mut dead: Vec<usize> = Vec::new();
        for (slot, fd) in fds.iter().enumerate() {
            let bus_id = poll_buses[slot];
            if fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                tlog!(
                    "[read-loop] Bus {} socket error (revents {:#06x}) - removing from poll set",
                    bus_id,
                    fd.revents
                );
                dead.push(slot);
                continue;
            }
            if fd.revents & libc::POLLIN != 0 {
                drain_bus(&buses, &dispatcher, bus_id);
            }
        }
        for slot in dead.into_iter().rev() {
            fds.remove(slot);
            poll_buses.remove(slot);
        }
    }
    tlog!("[read-loop] Stopped");
}

/// Read every queued frame off one bus, timestamping each as it arrives.
#[cfg(target_os = "linux")]
fn drain_bus(buses: &BusSet, dispatcher: &ReceiveDispatcher, bus_id: u8) {
    let bus = match buses.bus(bus_id) {
        Ok(bus) => bus,
        Err(_) => return,
    };
    loop {
        match bus.read_one() {
            Ok(Some((arb_id, frame))) => {
                let timestamp_us = crate::frame::monotonic_micros();
                dispatcher.dispatch(bus_id, arb_id, &frame, timestamp_us);
            }
            Ok(None) => break,
            Err(e) => {
                tlog!("[read-loop] Read failed on {}: {}", bus.interface(), e);
                break;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run_loop(
    _buses: Arc<BusSet>,
    _dispatcher: Arc<ReceiveDispatcher>,
    poll_timeout_ms: u64,
    stop: Arc<AtomicBool>,
) {
    tlog!("[read-loop] SocketCAN unavailable on this platform - read loop idle");
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(poll_timeout_ms));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CanConfig;

    #[test]
    fn test_shutdown_joins_without_buses() {
        let config = CanConfig {
            interface_prefix: "nosuchcan".to_string(),
            realtime_priority: false,
            poll_timeout_ms: 10,
        };
        let buses = Arc::new(BusSet::open_all(&config));
        let dispatcher = Arc::new(ReceiveDispatcher::new());
        let mut handle = spawn(buses, dispatcher, config.poll_timeout_ms, false);
        handle.shutdown();
        assert!(handle.thread.is_none());
    }

    #[test]
    fn test_double_shutdown_is_harmless() {
        let config = CanConfig {
            interface_prefix: "nosuchcan".to_string(),
            realtime_priority: false,
            poll_timeout_ms: 10,
        };
        let buses = Arc::new(BusSet::open_all(&config));
        let dispatcher = Arc::new(ReceiveDispatcher::new());
        let mut handle = spawn(buses, dispatcher, config.poll_timeout_ms, false);
        handle.shutdown();
        handle.shutdown();
    }
}
