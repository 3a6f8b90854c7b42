// src/manager.rs
//
// CanBusManager: the explicitly constructed owner of the whole subsystem.
// Opens the buses, spawns the read and write loops, and keeps the
// device-handle table. There is no process-global state; tests build an
// isolated manager each.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::bus::dispatch::ReceiveDispatcher;
use crate::bus::read_loop::{self, ReadLoopHandle};
use crate::bus::scheduler::SchedulerSnapshot;
use crate::bus::write_loop::{self, WriteLoopHandle};
use crate::bus::{BusSet, BusTx, CanConfig};
use crate::device::{CanMessage, CanStreamSession, DeviceState};
use crate::error::{CanError, CanResult};
use crate::id::{CanDeviceType, CanManufacturer};
use crate::stream::{AllCanStream, FrameSink, MappedCanStream, StreamDescriptor};

/// Opaque handle to an initialized device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanDeviceHandle(u32);

pub struct CanBusManager {
    config: CanConfig,
    buses: Arc<BusSet>,
    dispatcher: Arc<ReceiveDispatcher>,
    write_loop: WriteLoopHandle,
    read_loop: ReadLoopHandle,
    devices: Mutex<HashMap<u32, Arc<DeviceState>>>,
    next_handle: AtomicU32,
}

impl CanBusManager {
    /// Open every bus and start both loops. Bus bring-up failures are
    /// logged, not returned; a manager over zero usable buses still works
    /// for cache reads and teardown.
    pub fn new(config: CanConfig) -> Self {
        let buses = Arc::new(BusSet::open_all(&config));
        let dispatcher = Arc::new(ReceiveDispatcher::new());
        let write_loop = write_loop::spawn(Arc::clone(&buses), config.realtime_priority);
        let read_loop = read_loop::spawn(
            Arc::clone(&buses),
            Arc::clone(&dispatcher),
            config.poll_timeout_ms,
            config.realtime_priority,
        );

        CanBusManager {
            config,
            buses,
            dispatcher,
            write_loop,
            read_loop,
            devices: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &CanConfig {
        &self.config
    }

    /// Whether the bus came up at start; buses never recover after a
    /// failed bring-up.
    pub fn bus_usable(&self, bus_id: u8) -> bool {
        self.buses
            .bus(bus_id)
            .map(|bus| bus.is_usable())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Handle lifecycle
    // ------------------------------------------------------------------

    /// Allocate a device handle on bus 0 and subscribe its cache stream to
    /// the device's inbound traffic.
    pub fn initialize_device(
        &self,
        manufacturer: CanManufacturer,
        device_type: CanDeviceType,
        device_id: u8,
    ) -> CanDeviceHandle {
        let descriptor = StreamDescriptor {
            bus_id: 0,
            manufacturer: manufacturer.into(),
            device_type: device_type.into(),
            device_id,
        };
        let stream = Arc::new(MappedCanStream::new(descriptor));
        let sink = Arc::downgrade(&stream) as Weak<dyn FrameSink>;
        self.dispatcher
            .register_stream(descriptor.bus_id, descriptor.filter_key(), sink);

        let tx = BusTx {
            buses: Arc::clone(&self.buses),
            scheduler: self.write_loop.scheduler(),
        };
        let state = Arc::new(DeviceState::new(descriptor, stream, tx));
        let handle = CanDeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.devices.lock().unwrap().insert(handle.0, state);
        tlog!(
            "[device] Handle {} opened for {:?}/{:?} id {}",
            handle.0,
            manufacturer,
            device_type,
            device_id
        );
        handle
    }

    /// Cancel the handle's periodic sends and free it. Further calls with
    /// this handle are InvalidHandle.
    pub fn clean_device(&self, handle: CanDeviceHandle) -> CanResult<()> {
        let state = {
            self.devices
                .lock()
                .unwrap()
                .remove(&handle.0)
                .ok_or(CanError::InvalidHandle)?
        };
        state.clean();
        tlog!("[device] Handle {} closed", handle.0);
        Ok(())
    }

    fn device(&self, handle: CanDeviceHandle) -> CanResult<Arc<DeviceState>> {
        self.devices
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or(CanError::InvalidHandle)
    }

    // ------------------------------------------------------------------
    // Device operations
    // ------------------------------------------------------------------

    pub fn write_packet(
        &self,
        handle: CanDeviceHandle,
        api_id: u16,
        data: &[u8],
    ) -> CanResult<()> {
        self.device(handle)?.write_packet(api_id, data)
    }

    pub fn write_packet_repeating(
        &self,
        handle: CanDeviceHandle,
        api_id: u16,
        data: &[u8],
        period_ms: i32,
    ) -> CanResult<()> {
        self.device(handle)?
            .write_packet_repeating(api_id, data, period_ms)
    }

    pub fn write_rtr_frame(
        &self,
        handle: CanDeviceHandle,
        api_id: u16,
        length: u8,
    ) -> CanResult<()> {
        self.device(handle)?.write_rtr_frame(api_id, length)
    }

    pub fn stop_repeating(&self, handle: CanDeviceHandle, api_id: u16) -> CanResult<()> {
        self.device(handle)?.stop_repeating(api_id)
    }

    pub fn read_packet_new(&self, handle: CanDeviceHandle, api_id: u16) -> CanResult<CanMessage> {
        self.device(handle)?.read_packet_new(api_id)
    }

    pub fn read_packet_latest(
        &self,
        handle: CanDeviceHandle,
        api_id: u16,
    ) -> CanResult<CanMessage> {
        self.device(handle)?.read_packet_latest(api_id)
    }

    pub fn read_packet_timeout(
        &self,
        handle: CanDeviceHandle,
        api_id: u16,
        timeout_ms: u32,
    ) -> CanResult<CanMessage> {
        self.device(handle)?.read_packet_timeout(api_id, timeout_ms)
    }

    pub fn read_periodic_packet(
        &self,
        handle: CanDeviceHandle,
        api_id: u16,
        timeout_ms: u32,
        period_ms: u32,
    ) -> CanResult<CanMessage> {
        self.device(handle)?
            .read_periodic_packet(api_id, timeout_ms, period_ms)
    }

    /// Open a capture session for one of the device's API ids. The session
    /// queue grows until drained; `max_frames` caps each `read()` call.
    pub fn start_stream(
        &self,
        handle: CanDeviceHandle,
        api_id: u16,
        max_frames: usize,
    ) -> CanResult<CanStreamSession> {
        if max_frames == 0 {
            return Err(CanError::ParameterOutOfRange);
        }
        let device = self.device(handle)?;
        let descriptor = device.descriptor();
        let stream = Arc::new(AllCanStream::new(descriptor));
        let sink = Arc::downgrade(&stream) as Weak<dyn FrameSink>;
        self.dispatcher
            .register_stream(descriptor.bus_id, descriptor.filter_key(), sink);
        Ok(CanStreamSession::new(stream, api_id, max_frames))
    }

    // ------------------------------------------------------------------
    // Diagnostics / teardown
    // ------------------------------------------------------------------

    /// Live periodic-send buckets, fetched from the write loop.
    pub fn scheduler_snapshot(&self) -> SchedulerSnapshot {
        self.write_loop.scheduler().snapshot()
    }

    /// Stop the read loop, cancel every handle's periodic sends, then stop
    /// the write loop. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.read_loop.shutdown();
        let devices: Vec<Arc<DeviceState>> = {
            self.devices
                .lock()
                .unwrap()
                .drain()
                .map(|(_, state)| state)
                .collect()
        };
        for device in devices {
            device.clean();
        }
        self.write_loop.shutdown();
    }
}

impl Drop for CanBusManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
