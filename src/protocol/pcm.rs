// src/protocol/pcm.rs
//
// CTRE Pneumatics Control Module frames: inbound status with solenoid,
// compressor, and fault state, and the outbound control frame the robot
// keeps alive. Analog fields stay as the raw counts the module reports.

use serde::{Deserialize, Serialize};

use crate::error::CanResult;
use crate::id::{CanDeviceType, CanManufacturer};
use crate::protocol::require_len;

pub const PCM_MANUFACTURER: CanManufacturer = CanManufacturer::Ctre;
pub const PCM_DEVICE_TYPE: CanDeviceType = CanDeviceType::Pneumatics;

pub const STATUS_1_API_ID: u16 = 0x50;
pub const STATUS_SOL_FAULTS_API_ID: u16 = 0x51;
pub const STATUS_DEBUG_API_ID: u16 = 0x52;
pub const CONTROL_1_API_ID: u16 = 0x70;
pub const CONTROL_2_API_ID: u16 = 0x71;
/// Payload: eight per-solenoid one-shot durations, 10 ms per unit.
pub const CONTROL_ONE_SHOT_DUR_API_ID: u16 = 0x72;

/// The module disables outputs when control frames stop for this long.
pub const CONTROL_TIMEOUT_MS: u32 = 100;
/// Status frame cadence.
pub const STATUS_PERIOD_MS: i32 = 25;
/// Default control-frame send period.
pub const CONTROL_PERIOD_MS: i32 = 20;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmStatus1 {
    pub solenoid_bits: u8,
    pub compressor_on: bool,
    pub sticky_fault_fuse_tripped: bool,
    pub sticky_fault_comp_current_too_high: bool,
    pub fault_fuse_tripped: bool,
    pub fault_comp_current_too_high: bool,
    pub fault_hardware_failure: bool,
    pub closed_loop_enabled: bool,
    pub pressure_switch: bool,
    pub battery_voltage_raw: u8,
    /// 10-bit solenoid rail reading.
    pub solenoid_voltage_raw: u16,
    /// 10-bit compressor current reading.
    pub compressor_current_raw: u16,
    pub sticky_fault_di_too_high: bool,
    pub fault_di_too_high: bool,
    pub module_enabled: bool,
    pub closed_loop_output: bool,
    /// Seed the module expects echoed in control frames.
    pub token_seed: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmSolenoidFaults {
    /// Channels disabled after shorting.
    pub solenoid_blacklist: u8,
    pub sticky_fault_comp_no_current: bool,
    pub fault_comp_no_current: bool,
    pub sticky_fault_solenoid_jumper: bool,
    pub fault_solenoid_jumper: bool,
}

pub fn unpack_status1(data: &[u8]) -> CanResult<PcmStatus1> {
    require_len(data, 8)?;
    let flags = data[1];
    let tail_flags = data[5];
    Ok(PcmStatus1 {
        solenoid_bits: data[0],
        compressor_on: flags & 0x01 != 0,
        sticky_fault_fuse_tripped: flags & 0x02 != 0,
        sticky_fault_comp_current_too_high: flags & 0x04 != 0,
        fault_fuse_tripped: flags & 0x08 != 0,
        fault_comp_current_too_high: flags & 0x10 != 0,
        fault_hardware_failure: flags & 0x20 != 0,
        closed_loop_enabled: flags & 0x40 != 0,
        pressure_switch: flags & 0x80 != 0,
        battery_voltage_raw: data[2],
        solenoid_voltage_raw: (data[3] as u16) << 2 | (data[4] >> 6) as u16,
        compressor_current_raw: ((data[4] & 0x3F) as u16) << 4 | (tail_flags >> 4) as u16,
        sticky_fault_di_too_high: tail_flags & 0x01 != 0,
        fault_di_too_high: tail_flags & 0x02 != 0,
        module_enabled: tail_flags & 0x04 != 0,
        closed_loop_output: tail_flags & 0x08 != 0,
        token_seed: (data[6] as u16) << 8 | data[7] as u16,
    })
}

pub fn unpack_solenoid_faults(data: &[u8]) -> CanResult<PcmSolenoidFaults> {
    require_len(data, 2)?;
    let flags = data[1];
    Ok(PcmSolenoidFaults {
        solenoid_blacklist: data[0],
        sticky_fault_comp_no_current: flags & 0x10 != 0,
        fault_comp_no_current: flags & 0x20 != 0,
        sticky_fault_solenoid_jumper: flags & 0x40 != 0,
        fault_solenoid_jumper: flags & 0x80 != 0,
    })
}

// ============================================================================
// Control
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PcmControl {
    /// Echo of the status frame's token seed.
    pub token: u16,
    pub solenoid_bits: u8,
    pub closed_loop_output: bool,
    pub compressor_on: bool,
    pub closed_loop_enable: bool,
    pub clear_sticky_faults: bool,
    pub one_shot_field: u16,
}

pub fn pack_control(control: &PcmControl) -> [u8; 6] {
    let mut flags = 0u8;
    if control.closed_loop_output {
        flags |= 0x10;
    }
    if control.compressor_on {
        flags |= 0x20;
    }
    if control.closed_loop_enable {
        flags |= 0x40;
    }
    if control.clear_sticky_faults {
        flags |= 0x80;
    }
    [
        (control.token >> 8) as u8,
        control.token as u8,
        control.solenoid_bits,
        flags,
        (control.one_shot_field >> 8) as u8,
        control.one_shot_field as u8,
    ]
}

pub fn unpack_control(data: &[u8]) -> CanResult<PcmControl> {
    require_len(data, 6)?;
    let flags = data[3];
    Ok(PcmControl {
        token: (data[0] as u16) << 8 | data[1] as u16,
        solenoid_bits: data[2],
        closed_loop_output: flags & 0x10 != 0,
        compressor_on: flags & 0x20 != 0,
        closed_loop_enable: flags & 0x40 != 0,
        clear_sticky_faults: flags & 0x80 != 0,
        one_shot_field: (data[4] as u16) << 8 | data[5] as u16,
    })
}

/// Builds the one-shot duration payload: one byte per solenoid channel,
/// 10 ms per unit.
pub fn pack_one_shot_durations(durations_10ms: &[u8; 8]) -> [u8; 8] {
    *durations_10ms
}

pub fn unpack_one_shot_durations(data: &[u8]) -> CanResult<[u8; 8]> {
    require_len(data, 8)?;
    let mut durations = [0u8; 8];
    durations.copy_from_slice(&data[..8]);
    Ok(durations)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_status1() {
        // solenoids 0b1010, compressor on + pressure switch, battery 0x7F,
        // solenoid rail 1000, compressor current 500, module enabled,
        // token seed 0xABCD
        let data = [0x0A, 0x81, 0x7F, 250, 31, 0x44, 0xAB, 0xCD];
        let status = unpack_status1(&data).unwrap();
        assert_eq!(status.solenoid_bits, 0x0A);
        assert!(status.compressor_on);
        assert!(status.pressure_switch);
        assert!(!status.fault_hardware_failure);
        assert_eq!(status.battery_voltage_raw, 0x7F);
        assert_eq!(status.solenoid_voltage_raw, 1000);
        assert_eq!(status.compressor_current_raw, 500);
        assert!(status.module_enabled);
        assert!(!status.closed_loop_output);
        assert_eq!(status.token_seed, 0xABCD);
    }

    #[test]
    fn test_unpack_solenoid_faults() {
        let faults = unpack_solenoid_faults(&[0x81, 0xA0]).unwrap();
        assert_eq!(faults.solenoid_blacklist, 0x81);
        assert!(!faults.sticky_fault_comp_no_current);
        assert!(faults.fault_comp_no_current);
        assert!(!faults.sticky_fault_solenoid_jumper);
        assert!(faults.fault_solenoid_jumper);
    }

    #[test]
    fn test_control_pack_unpack_inverse() {
        let control = PcmControl {
            token: 0xABCD,
            solenoid_bits: 0x55,
            closed_loop_output: false,
            compressor_on: true,
            closed_loop_enable: true,
            clear_sticky_faults: false,
            one_shot_field: 0x1234,
        };
        let bytes = pack_control(&control);
        assert_eq!(bytes, [0xAB, 0xCD, 0x55, 0x60, 0x12, 0x34]);
        assert_eq!(unpack_control(&bytes).unwrap(), control);
    }

    #[test]
    fn test_one_shot_durations_pack_unpack_inverse() {
        // channel 1 held 100 ms, channel 5 pinned at the 2550 ms max
        let durations = [0, 10, 25, 0, 1, 255, 0, 50];
        let bytes = pack_one_shot_durations(&durations);
        assert_eq!(bytes, durations);
        assert_eq!(unpack_one_shot_durations(&bytes).unwrap(), durations);
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(unpack_status1(&[0u8; 7]).is_err());
        assert!(unpack_solenoid_faults(&[0u8; 1]).is_err());
        assert!(unpack_control(&[0u8; 5]).is_err());
        assert!(unpack_one_shot_durations(&[0u8; 7]).is_err());
    }
}
