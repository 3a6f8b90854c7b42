// src/lib.rs
//
// CAN bus communication layer for robot control. Opens Linux SocketCAN
// interfaces, routes received frames into per-device caches and raw
// streams, and drives periodic transmits from a dedicated write thread.
//
// Device I/O goes through `CanBusManager`: open a handle with
// `initialize_device`, exchange packets keyed by 10-bit API id, and
// release the handle with `clean_device` when the device goes away.

#[macro_use]
mod logging;

mod bus;
mod device;
mod error;
mod frame;
pub mod id;
mod manager;
pub mod protocol;
mod stream;

pub use bus::scheduler::{PeriodicBucketInfo, SchedulerSnapshot};
pub use bus::{CanConfig, NUM_CAN_BUSES};
pub use device::{CanMessage, CanStreamSession};
pub use error::{CanError, CanResult};
pub use frame::{monotonic_micros, CanFrame, ReceivedCanFrame, CLASSIC_MAX_DATA, FD_MAX_DATA};
pub use id::{ArbitrationId, CanDeviceType, CanManufacturer};
pub use logging::{init_file_logging, stop_file_logging};
pub use manager::{CanBusManager, CanDeviceHandle};
