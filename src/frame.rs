// src/frame.rs
//
// CAN frame value types shared by the bus, scheduler, and stream layers,
// plus the monotonic microsecond clock frames are stamped with. Payloads
// live in a fixed 64-byte array so cache overwrite and dispatch never
// allocate.

use once_cell::sync::Lazy;
use std::time::Instant;

use crate::error::{CanError, CanResult};

/// Classic CAN payload limit in bytes.
pub const CLASSIC_MAX_DATA: usize = 8;
/// CAN FD payload limit in bytes.
pub const FD_MAX_DATA: usize = 64;

/// One CAN frame as carried between subsystem layers. The arbitration id
/// travels separately; this is payload and format only.
#[derive(Debug, Clone, Copy)]
pub struct CanFrame {
    pub(crate) is_fd: bool,
    pub(crate) is_rtr: bool,
    pub(crate) len: u8,
    pub(crate) data: [u8; FD_MAX_DATA],
}

impl CanFrame {
    /// Classic data frame. Payloads over 8 bytes are rejected, not truncated.
    pub fn classic(data: &[u8]) -> CanResult<Self> {
        if data.len() > CLASSIC_MAX_DATA {
            return Err(CanError::ParameterOutOfRange);
        }
        let mut buf = [0u8; FD_MAX_DATA];
        buf[..data.len()].copy_from_slice(data);
        Ok(CanFrame {
            is_fd: false,
            is_rtr: false,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// FD data frame, up to 64 bytes. Bit-rate switch is applied at send time.
    pub fn fd(data: &[u8]) -> CanResult<Self> {
        if data.len() > FD_MAX_DATA {
            return Err(CanError::ParameterOutOfRange);
        }
        let mut buf = [0u8; FD_MAX_DATA];
        buf[..data.len()].copy_from_slice(data);
        Ok(CanFrame {
            is_fd: true,
            is_rtr: false,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Remote-transmission-request frame: a DLC but no payload.
    pub fn rtr(length: u8) -> CanResult<Self> {
        if length as usize > CLASSIC_MAX_DATA {
            return Err(CanError::ParameterOutOfRange);
        }
        Ok(CanFrame {
            is_fd: false,
            is_rtr: true,
            len: length,
            data: [0u8; FD_MAX_DATA],
        })
    }

    pub fn is_fd(&self) -> bool {
        self.is_fd
    }

    pub fn is_rtr(&self) -> bool {
        self.is_rtr
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes, `len` long. All zero for RTR frames.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// A frame as delivered by the read loop: payload plus the 10-bit API id
/// extracted from its arbitration id and the arrival timestamp.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedCanFrame {
    pub api_id: u16,
    pub frame: CanFrame,
    pub timestamp_us: u64,
}

// ============================================================================
// Monotonic Clock
// ============================================================================

static MONOTONIC_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds on the monotonic base all frame timestamps share.
/// Callers compare this against a cached frame's `timestamp_us` to get its age.
pub fn monotonic_micros() -> u64 {
    MONOTONIC_BASE.elapsed().as_micros() as u64
}

// ============================================================================
// SocketCAN Conversion
// ============================================================================

#[cfg(target_os = "linux")]
pub(crate) mod convert {
    use socketcan::{CanAnyFrame, EmbeddedFrame, Frame};

    use super::{CanFrame, FD_MAX_DATA};

    /// Convert a received SocketCAN frame into the subsystem frame type.
    /// Returns the 29-bit arbitration id (flag bits stripped) and the frame.
    /// Error frames yield `None` and are dropped before dispatch.
    pub(crate) fn from_any_frame(any: &CanAnyFrame) -> Option<(u32, CanFrame)> {
        match any {
            CanAnyFrame::Normal(frame) => {
                let mut data = [0u8; FD_MAX_DATA];
                let len = frame.data().len();
                data[..len].copy_from_slice(frame.data());
                Some((
                    frame.raw_id(),
                    CanFrame {
                        is_fd: false,
                        is_rtr: false,
                        len: len as u8,
                        data,
                    },
                ))
            }
            CanAnyFrame::Remote(frame) => Some((
                frame.raw_id(),
                CanFrame {
                    is_fd: false,
                    is_rtr: true,
                    len: frame.dlc() as u8,
                    data: [0u8; FD_MAX_DATA],
                },
            )),
            CanAnyFrame::Fd(frame) => {
                let mut data = [0u8; FD_MAX_DATA];
                let len = frame.data().len();
                data[..len].copy_from_slice(frame.data());
                Some((
                    frame.raw_id(),
                    CanFrame {
                        is_fd: true,
                        is_rtr: false,
                        len: len as u8,
                        data,
                    },
                ))
            }
            // Bus error reports never reach the dispatcher
            CanAnyFrame::Error(_) => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_frame_length_limit() {
        assert!(CanFrame::classic(&[0u8; 8]).is_ok());
        assert_eq!(
            CanFrame::classic(&[0u8; 9]).unwrap_err(),
            CanError::ParameterOutOfRange
        );
        let f = CanFrame::classic(&[1, 2, 3]).unwrap();
        assert_eq!(f.data(), &[1, 2, 3]);
        assert!(!f.is_fd());
        assert!(!f.is_rtr());
    }

    #[test]
    fn test_fd_frame_length_limit() {
        assert!(CanFrame::fd(&[0u8; 64]).is_ok());
        assert_eq!(
            CanFrame::fd(&[0u8; 65]).unwrap_err(),
            CanError::ParameterOutOfRange
        );
        assert!(CanFrame::fd(&[0u8; 12]).unwrap().is_fd());
    }

    #[test]
    fn test_rtr_frame_carries_dlc_only() {
        let f = CanFrame::rtr(4).unwrap();
        assert!(f.is_rtr());
        assert_eq!(f.len(), 4);
        assert!(f.data().iter().all(|&b| b == 0));
        assert_eq!(CanFrame::rtr(9).unwrap_err(), CanError::ParameterOutOfRange);
    }

    #[test]
    fn test_monotonic_micros_is_monotonic() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_convert_data_frame() {
        use socketcan::{CanAnyFrame, CanDataFrame, EmbeddedFrame, ExtendedId, Id};

        let id = ExtendedId::new(0x0902_1443).unwrap();
        let os_frame = CanDataFrame::new(Id::Extended(id), &[0xAA, 0xBB]).unwrap();
        let (arb_id, frame) = convert::from_any_frame(&CanAnyFrame::Normal(os_frame)).unwrap();
        assert_eq!(arb_id, 0x0902_1443);
        assert_eq!(frame.data(), &[0xAA, 0xBB]);
        assert!(!frame.is_fd());
    }
}
