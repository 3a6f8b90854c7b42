// src/protocol/pdp.rs
//
// CTRE Power Distribution Panel status frames. Sixteen channel currents
// arrive as split hi/lo 10-bit fields spread over three status frames;
// a fourth frame carries the integrated current/power/energy totals.
// Bit positions follow the module firmware's little-endian packing.

use serde::{Deserialize, Serialize};

use crate::error::CanResult;
use crate::id::{CanDeviceType, CanManufacturer};
use crate::protocol::require_len;

pub const PDP_MANUFACTURER: CanManufacturer = CanManufacturer::Ctre;
pub const PDP_DEVICE_TYPE: CanDeviceType = CanDeviceType::PowerDistribution;

/// Channels 1-6.
pub const STATUS_1_API_ID: u16 = 0x50;
/// Channels 7-12.
pub const STATUS_2_API_ID: u16 = 0x51;
/// Channels 13-16 plus battery resistance, bus voltage, temperature.
pub const STATUS_3_API_ID: u16 = 0x52;
/// Integrated totals over the measurement window.
pub const STATUS_ENERGY_API_ID: u16 = 0x5D;
pub const CONTROL_1_API_ID: u16 = 0x70;

/// Status frames arrive every 25 ms; reads older than this are stale.
pub const TIMEOUT_MS: u32 = 50;

const CURRENT_LSB_AMPS: f64 = 0.125;
const VOLTAGE_LSB_VOLTS: f64 = 0.05;
const VOLTAGE_OFFSET_VOLTS: f64 = 4.0;
const TEMPERATURE_LSB_CELSIUS: f64 = 1.03250836957542;
const TEMPERATURE_OFFSET_CELSIUS: f64 = -67.8564500484966;

// ============================================================================
// Status Records
// ============================================================================

/// Channel currents 1-6 in amps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdpStatus1 {
    pub currents_amps: [f64; 6],
}

/// Channel currents 7-12 in amps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdpStatus2 {
    pub currents_amps: [f64; 6],
}

/// Channel currents 13-16 plus panel health readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdpStatus3 {
    pub currents_amps: [f64; 4],
    pub internal_resistance_mohms: u8,
    pub bus_voltage_volts: f64,
    pub temperature_celsius: f64,
}

/// Integrated totals; energy covers `measurement_window_ms` per tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdpStatusEnergy {
    pub measurement_window_ms: u8,
    pub total_current_amps: f64,
    pub total_power_watts: f64,
    pub total_energy_joules: f64,
}

// ============================================================================
// Unpack
// ============================================================================

// Four 10-bit channels packed into five bytes:
//   chanA = a<<2 | b>>6,  chanB = (b&0x3F)<<4 | c>>4,
//   chanC = (c&0x0F)<<6 | d>>2,  chanD = (d&0x03)<<8 | e
fn channel_group(d: &[u8]) -> [u16; 4] {
    [
        (d[0] as u16) << 2 | (d[1] >> 6) as u16,
        ((d[1] & 0x3F) as u16) << 4 | (d[2] >> 4) as u16,
        ((d[2] & 0x0F) as u16) << 6 | (d[3] >> 2) as u16,
        ((d[3] & 0x03) as u16) << 8 | d[4] as u16,
    ]
}

// Two more channels in the tail three bytes; the last nibble is reserved.
fn channel_pair(b5: u8, b6: u8, b7: u8) -> [u16; 2] {
    [
        (b5 as u16) << 2 | (b6 >> 6) as u16,
        ((b6 & 0x3F) as u16) << 4 | (b7 >> 4) as u16,
    ]
}

fn amps(raw: u16) -> f64 {
    raw as f64 * CURRENT_LSB_AMPS
}

pub fn unpack_status1(data: &[u8]) -> CanResult<PdpStatus1> {
    require_len(data, 8)?;
    let head = channel_group(&data[0..5]);
    let tail = channel_pair(data[5], data[6], data[7]);
    Ok(PdpStatus1 {
        currents_amps: [
            amps(head[0]),
            amps(head[1]),
            amps(head[2]),
            amps(head[3]),
            amps(tail[0]),
            amps(tail[1]),
        ],
    })
}

pub fn unpack_status2(data: &[u8]) -> CanResult<PdpStatus2> {
    let status1 = unpack_status1(data)?;
    Ok(PdpStatus2 {
        currents_amps: status1.currents_amps,
    })
}

pub fn unpack_status3(data: &[u8]) -> CanResult<PdpStatus3> {
    require_len(data, 8)?;
    let head = channel_group(&data[0..5]);
    Ok(PdpStatus3 {
        currents_amps: [amps(head[0]), amps(head[1]), amps(head[2]), amps(head[3])],
        internal_resistance_mohms: data[5],
        bus_voltage_volts: data[6] as f64 * VOLTAGE_LSB_VOLTS + VOLTAGE_OFFSET_VOLTS,
        temperature_celsius: data[7] as f64 * TEMPERATURE_LSB_CELSIUS + TEMPERATURE_OFFSET_CELSIUS,
    })
}

pub fn unpack_status_energy(data: &[u8]) -> CanResult<PdpStatusEnergy> {
    require_len(data, 8)?;
    let window_ms = data[0];
    let current_raw = (data[1] as u32) << 4 | (data[2] >> 4) as u32;
    let power_raw =
        ((data[2] & 0x0F) as u32) << 12 | (data[3] as u32) << 4 | (data[4] >> 4) as u32;
    let energy_raw = ((data[4] & 0x0F) as u32) << 24
        | (data[5] as u32) << 16
        | (data[6] as u32) << 8
        | data[7] as u32;
    Ok(PdpStatusEnergy {
        measurement_window_ms: window_ms,
        total_current_amps: current_raw as f64 * CURRENT_LSB_AMPS,
        total_power_watts: power_raw as f64 * CURRENT_LSB_AMPS,
        // Per-window units integrate at 0.125 per count per millisecond
        total_energy_joules: energy_raw as f64 * CURRENT_LSB_AMPS * window_ms as f64 * 0.001,
    })
}

// ============================================================================
// Control
// ============================================================================

/// Control payload clearing the panel's sticky fault flags.
pub fn pack_clear_sticky_faults() -> [u8; 1] {
    [0x80]
}

/// Control payload zeroing the integrated energy total.
pub fn pack_reset_total_energy() -> [u8; 1] {
    [0x40]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_unpack_status1_channel_split() {
        // chan1=682, chan2=341, chan3=0, chan4=1023, chan5=8, chan6=16
        let data = [0xAA, 0x95, 0x50, 0x03, 0xFF, 0x02, 0x01, 0x00];
        let status = unpack_status1(&data).unwrap();
        let expected = [85.25, 42.625, 0.0, 127.875, 1.0, 2.0];
        for (got, want) in status.currents_amps.iter().zip(expected) {
            assert!(close(*got, want), "got {} want {}", got, want);
        }
    }

    #[test]
    fn test_unpack_status3_health_fields() {
        // Channels zero; resistance 12 mOhm, voltage raw 120, temp raw 100
        let data = [0, 0, 0, 0, 0, 12, 120, 100];
        let status = unpack_status3(&data).unwrap();
        assert_eq!(status.internal_resistance_mohms, 12);
        assert!(close(status.bus_voltage_volts, 10.0));
        assert!(close(status.temperature_celsius, 35.3943869090454));
        assert!(status.currents_amps.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn test_unpack_status_energy_totals() {
        // current raw 0x123, power raw 0x4567, energy raw 0x0189ABCD, 20ms window
        let data = [20, 0x12, 0x34, 0x56, 0x71, 0x89, 0xAB, 0xCD];
        let status = unpack_status_energy(&data).unwrap();
        assert_eq!(status.measurement_window_ms, 20);
        assert!(close(status.total_current_amps, 0x123 as f64 * 0.125));
        assert!(close(status.total_power_watts, 0x4567 as f64 * 0.125));
        assert!(close(
            status.total_energy_joules,
            0x0189_ABCD as f64 * 0.125 * 0.020
        ));
    }

    #[test]
    fn test_unpack_rejects_short_frames() {
        assert!(unpack_status1(&[0u8; 7]).is_err());
        assert!(unpack_status3(&[]).is_err());
        assert!(unpack_status_energy(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_control_payloads() {
        assert_eq!(pack_clear_sticky_faults(), [0x80]);
        assert_eq!(pack_reset_total_energy(), [0x40]);
    }
}
