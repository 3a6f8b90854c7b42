// src/id.rs
//
// Arbitration-id codec for the 29-bit extended CAN identifier used by
// robot device traffic:
//
//   deviceType(5) << 24 | manufacturer(8) << 16 | apiId(10) << 6 | deviceId(6)
//
// The device filter key is the id with the 10 API-id bits cleared; it
// groups every message from one logical device regardless of message type.

use serde::{Deserialize, Serialize};

pub const DEVICE_TYPE_SHIFT: u32 = 24;
pub const MANUFACTURER_SHIFT: u32 = 16;
pub const API_ID_SHIFT: u32 = 6;

pub const DEVICE_TYPE_MASK: u32 = 0x1F;
pub const MANUFACTURER_MASK: u32 = 0xFF;
pub const API_ID_MASK: u32 = 0x3FF;
pub const DEVICE_ID_MASK: u32 = 0x3F;

/// All id bits except the API id. Receive-side grouping key.
pub const DEVICE_FILTER_MASK: u32 = 0x1FFF_003F;

/// Largest valid API id (10 bits).
pub const MAX_API_ID: u16 = 0x3FF;

// ============================================================================
// Well-Known Field Values
// ============================================================================

/// CAN device manufacturer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CanManufacturer {
    Broadcast = 0,
    Ni = 1,
    LuminaryMicro = 2,
    Deka = 3,
    Ctre = 4,
    Rev = 5,
    Grapple = 6,
    MindSensors = 7,
    TeamUse = 8,
    KauaiLabs = 9,
    Copperforge = 10,
    PlayingWithFusion = 11,
    Studica = 12,
    TheThriftyBot = 13,
    ReduxRobotics = 14,
    AndyMark = 15,
    VividHosting = 16,
}

/// CAN device type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CanDeviceType {
    Broadcast = 0,
    RobotController = 1,
    MotorController = 2,
    RelayController = 3,
    GyroSensor = 4,
    Accelerometer = 5,
    UltrasonicSensor = 6,
    GearToothSensor = 7,
    PowerDistribution = 8,
    Pneumatics = 9,
    Miscellaneous = 10,
    IoBreakout = 11,
    ServoController = 12,
    FirmwareUpdate = 31,
}

impl From<CanManufacturer> for u8 {
    fn from(m: CanManufacturer) -> u8 {
        m as u8
    }
}

impl From<CanDeviceType> for u8 {
    fn from(t: CanDeviceType) -> u8 {
        t as u8
    }
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Decoded arbitration-id fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationId {
    pub manufacturer: u8,
    pub device_type: u8,
    pub api_id: u16,
    pub device_id: u8,
}

/// Pack the four device fields into a 29-bit arbitration id.
/// Out-of-range inputs are truncated to their field width, never rejected.
pub fn encode(manufacturer: u8, device_type: u8, api_id: u16, device_id: u8) -> u32 {
    (device_type as u32 & DEVICE_TYPE_MASK) << DEVICE_TYPE_SHIFT
        | (manufacturer as u32 & MANUFACTURER_MASK) << MANUFACTURER_SHIFT
        | (api_id as u32 & API_ID_MASK) << API_ID_SHIFT
        | (device_id as u32 & DEVICE_ID_MASK)
}

/// Split a 29-bit arbitration id into its device fields.
pub fn decode(arb_id: u32) -> ArbitrationId {
    ArbitrationId {
        manufacturer: ((arb_id >> MANUFACTURER_SHIFT) & MANUFACTURER_MASK) as u8,
        device_type: ((arb_id >> DEVICE_TYPE_SHIFT) & DEVICE_TYPE_MASK) as u8,
        api_id: ((arb_id >> API_ID_SHIFT) & API_ID_MASK) as u16,
        device_id: (arb_id & DEVICE_ID_MASK) as u8,
    }
}

/// Clear the API-id bits, leaving the per-device grouping key.
pub fn device_filter_key(arb_id: u32) -> u32 {
    arb_id & DEVICE_FILTER_MASK
}

/// Extract the 10-bit API id.
pub fn api_id_of(arb_id: u32) -> u16 {
    ((arb_id >> API_ID_SHIFT) & API_ID_MASK) as u16
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        // Sweep the corners of each field plus a few interior values
        for &manufacturer in &[0u8, 1, 4, 8, 127, 255] {
            for &device_type in &[0u8, 1, 9, 30, 31] {
                for &api_id in &[0u16, 1, 0x50, 0x1FF, 0x3FF] {
                    for &device_id in &[0u8, 3, 31, 63] {
                        let id = encode(manufacturer, device_type, api_id, device_id);
                        // Top 3 bits of the 32-bit container stay clear
                        assert_eq!(id & 0xE000_0000, 0);
                        let fields = decode(id);
                        assert_eq!(fields.manufacturer, manufacturer);
                        assert_eq!(fields.device_type, device_type & 0x1F);
                        assert_eq!(fields.api_id, api_id);
                        assert_eq!(fields.device_id, device_id & 0x3F);
                    }
                }
            }
        }
    }

    #[test]
    fn test_encode_truncates_out_of_range() {
        // deviceId 0x7F exceeds 6 bits; only the low 6 survive
        let id = encode(4, 9, 0x50, 0x7F);
        assert_eq!(decode(id).device_id, 0x3F);
        // deviceType 0x3F exceeds 5 bits
        let id = encode(4, 0x3F, 0x50, 3);
        assert_eq!(decode(id).device_type, 0x1F);
    }

    #[test]
    fn test_filter_key_clears_api_bits() {
        let a = encode(CanManufacturer::Ctre.into(), CanDeviceType::Pneumatics.into(), 0x50, 3);
        let b = encode(CanManufacturer::Ctre.into(), CanDeviceType::Pneumatics.into(), 0x51, 3);
        assert_eq!(device_filter_key(a), device_filter_key(b));
        assert_ne!(a, b);
        // Mask value matches the layout: everything except apiId(10) << 6
        assert_eq!(DEVICE_FILTER_MASK, !(API_ID_MASK << API_ID_SHIFT) & 0x1FFF_FFFF);
    }

    #[test]
    fn test_api_id_extraction() {
        let id = encode(8, 10, 0x2A5, 12);
        assert_eq!(api_id_of(id), 0x2A5);
        assert_eq!(api_id_of(device_filter_key(id)), 0);
    }

    #[test]
    fn test_different_devices_have_different_filter_keys() {
        let a = encode(CanManufacturer::Rev.into(), CanDeviceType::MotorController.into(), 0x60, 1);
        let b = encode(CanManufacturer::Rev.into(), CanDeviceType::MotorController.into(), 0x60, 2);
        assert_ne!(device_filter_key(a), device_filter_key(b));
    }
}
