// src/bus/mod.rs
//
// SocketCAN bus ownership: socket bring-up, outbound frame construction,
// and the per-bus write lock. The read loop and write loop live in the
// submodules here.
//
// Requires the interface to be configured first:
//   sudo ip link set can0 up type can bitrate 1000000 dbitrate 5000000 fd on
//
// This module is only fully functional on Linux.

pub(crate) mod dispatch;
pub(crate) mod read_loop;
pub(crate) mod scheduler;
pub(crate) mod write_loop;

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};
use crate::frame::CanFrame;

/// Number of physical CAN buses the controller exposes.
pub const NUM_CAN_BUSES: usize = 1;

/// Valid bits of a 29-bit extended arbitration id.
pub(crate) const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

// ============================================================================
// Configuration
// ============================================================================

/// Subsystem configuration. Defaults match deployment hardware; tests point
/// `interface_prefix` at `vcan` and leave real-time priority off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Interface name prefix; bus N binds `<prefix><N>`.
    pub interface_prefix: String,
    /// Raise the loop threads to SCHED_FIFO priority at start-up.
    pub realtime_priority: bool,
    /// Read-loop poll timeout in milliseconds; bounds shutdown latency.
    pub poll_timeout_ms: u64,
}

impl Default for CanConfig {
    fn default() -> Self {
        CanConfig {
            interface_prefix: "can".to_string(),
            realtime_priority: true,
            poll_timeout_ms: 100,
        }
    }
}

// ============================================================================
// SocketCanBus
// ============================================================================

/// One physical bus: the raw socket (when bring-up succeeded) and the write
/// lock serialising sends from caller threads and the write loop.
pub(crate) struct SocketCanBus {
    index: u8,
    interface: String,
    #[cfg(target_os = "linux")]
    socket: Option<socketcan::CanFdSocket>,
    write_lock: Mutex<()>,
}

#[cfg(target_os = "linux")]
impl SocketCanBus {
    /// Open and bind the bus socket, non-blocking. Any failure marks the bus
    /// permanently unusable; that is logged here, never returned.
    pub(crate) fn open(index: u8, interface_prefix: &str) -> Self {
        use socketcan::Socket;

        let interface = format!("{}{}", interface_prefix, index);
        let socket = match socketcan::CanFdSocket::open(&interface) {
            Ok(socket) => match socket.set_nonblocking(true) {
                Ok(()) => {
                    tlog!("[socketcan] Bus {} up on {}", index, interface);
                    Some(socket)
                }
                Err(e) => {
                    tlog!(
                        "[socketcan] Failed to set {} non-blocking: {} - bus {} unavailable",
                        interface,
                        e,
                        index
                    );
                    None
                }
            },
            Err(e) => {
                tlog!(
                    "[socketcan] Failed to open {}: {} - bus {} unavailable",
                    interface,
                    e,
                    index
                );
                None
            }
        };

        SocketCanBus {
            index,
            interface,
            socket,
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Read one frame if the socket has one queued. `Ok(None)` covers both
    /// "nothing pending" and inbound error frames, which are dropped here.
    pub(crate) fn read_one(&self) -> std::io::Result<Option<(u32, CanFrame)>> {
        use socketcan::Socket;

        let socket = match &self.socket {
            Some(socket) => socket,
            None => return Ok(None),
        };
        match socket.read_frame() {
            Ok(any) => Ok(crate::frame::convert::from_any_frame(&any)),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Build the OS frame and send it in a single write under the bus write
    /// lock. The extended-id flag is always set; RTR and FD (+ bit-rate
    /// switch) map from the frame. Payload lengths are enforced by
    /// `CanFrame` construction.
    pub(crate) fn send_frame(&self, arb_id: u32, frame: &CanFrame) -> CanResult<()> {
        use socketcan::{
            frame::FdFlags, CanDataFrame, CanFdFrame, CanRemoteFrame, EmbeddedFrame, ExtendedId,
            Id, Socket,
        };

        if arb_id & !CAN_EFF_MASK != 0 {
            return Err(CanError::ParameterOutOfRange);
        }
        let socket = self
            .socket
            .as_ref()
            .ok_or(CanError::BusNotAvailable(self.index))?;
        let id = ExtendedId::new(arb_id).ok_or(CanError::ParameterOutOfRange)?;

        let _write_guard = self.write_lock.lock().unwrap();
        let result = if frame.is_rtr() {
            let os_frame = CanRemoteFrame::new_remote(Id::Extended(id), frame.len())
                .ok_or(CanError::ParameterOutOfRange)?;
            socket.write_frame(&os_frame)
        } else if frame.is_fd() {
            let os_frame = CanFdFrame::with_flags(Id::Extended(id), frame.data(), FdFlags::BRS)
                .ok_or(CanError::ParameterOutOfRange)?;
            socket.write_frame(&os_frame)
        } else {
            let os_frame = CanDataFrame::new(Id::Extended(id), frame.data())
                .ok_or(CanError::ParameterOutOfRange)?;
            socket.write_frame(&os_frame)
        };
        result.map_err(|e| CanError::SendFailed(format!("{} write: {}", self.interface, e)))
    }
}

#[cfg(not(target_os = "linux"))]
impl SocketCanBus {
    pub(crate) fn open(index: u8, interface_prefix: &str) -> Self {
        let interface = format!("{}{}", interface_prefix, index);
        tlog!(
            "[socketcan] SocketCAN is only available on Linux - bus {} ({}) unavailable",
            index,
            interface
        );
        SocketCanBus {
            index,
            interface,
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn send_frame(&self, _arb_id: u32, _frame: &CanFrame) -> CanResult<()> {
        let _write_guard = self.write_lock.lock().unwrap();
        Err(CanError::BusNotAvailable(self.index))
    }
}

impl SocketCanBus {
    pub(crate) fn is_usable(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.socket.is_some()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    pub(crate) fn index(&self) -> u8 {
        self.index
    }

    pub(crate) fn interface(&self) -> &str {
        &self.interface
    }
}

// ============================================================================
// BusSet / BusTx
// ============================================================================

/// All buses, opened once at subsystem start.
pub(crate) struct BusSet {
    buses: Vec<SocketCanBus>,
}

impl BusSet {
    pub(crate) fn open_all(config: &CanConfig) -> Self {
        let buses = (0..NUM_CAN_BUSES as u8)
            .map(|index| SocketCanBus::open(index, &config.interface_prefix))
            .collect();
        BusSet { buses }
    }

    pub(crate) fn bus(&self, bus_id: u8) -> CanResult<&SocketCanBus> {
        self.buses
            .get(bus_id as usize)
            .ok_or(CanError::ParameterOutOfRange)
    }

    pub(crate) fn send_frame(&self, bus_id: u8, arb_id: u32, frame: &CanFrame) -> CanResult<()> {
        self.bus(bus_id)?.send_frame(arb_id, frame)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SocketCanBus> {
        self.buses.iter()
    }
}

/// Transmit path handed to streams and device handles: the buses for
/// one-shot sends plus the write-loop channel for periodic registration.
#[derive(Clone)]
pub(crate) struct BusTx {
    pub(crate) buses: Arc<BusSet>,
    pub(crate) scheduler: write_loop::SchedulerHandle,
}

// ============================================================================
// Thread priority
// ============================================================================

/// Raise the calling thread to SCHED_FIFO at the given priority. Needs
/// CAP_SYS_NICE; on failure the thread keeps its default priority.
#[cfg(target_os = "linux")]
pub(crate) fn try_set_realtime_priority(tag: &str, priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        tlog!(
            "[{}] Failed to set real-time priority {}: {}",
            tag,
            priority,
            std::io::Error::from_raw_os_error(rc)
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn try_set_realtime_priority(_tag: &str, _priority: i32) {}
