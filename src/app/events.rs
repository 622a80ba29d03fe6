//! Event message encoding
//!
//! Input notification events are 24-bit forward frames with bit 16 clear.
//! The upper byte pair identifies the source according to the configured
//! event scheme; the low 10 bits carry the top of the input value.

use crate::vars::{DeviceVariables, RomVariables};

/// Builds the input-notification frame for the given scheme.
///
/// Callers must have applied the scheme fallback rules first (a scheme
/// relying on an unassigned address falls back to scheme 0).
pub fn event_frame(scheme: u8, vars: &DeviceVariables, rom: &RomVariables, input_value: u16) -> u32 {
    let value = (input_value >> 6) as u32 & 0x3ff;
    let instance_type = rom.instance_type as u32;
    match scheme {
        // Instance addressing: instance type and number.
        0 => {
            0x80_0000
                | (instance_type << 17) & 0x3e_0000
                | 0x8000
                | ((rom.instance_number as u32) << 10) & 0x7c00
                | value
        }
        // Device addressing: short address and instance type.
        1 => {
            ((vars.short_address as u32) << 17) & 0x7e_0000
                | (instance_type << 10) & 0x7c00
                | value
        }
        // Device and instance addressing: short address and number.
        2 => {
            ((vars.short_address as u32) << 17) & 0x7e_0000
                | 0x8000
                | ((rom.instance_number as u32) << 10) & 0x7c00
                | value
        }
        // Device group addressing: lowest group we are a member of.
        3 => {
            0x80_0000
                | ((lowest_group(vars.device_groups, 1) as u32) << 17) & 0x3e_0000
                | (instance_type << 10) & 0x7c00
                | value
        }
        // Instance group addressing: the primary instance group.
        _ => {
            0xc0_0000
                | ((vars.instance_group0 as u32) << 17) & 0x3e_0000
                | (instance_type << 10) & 0x7c00
                | value
        }
    }
}

/// Builds the power-cycle notification frame: group membership and short
/// address of the device, each behind a presence bit.
pub fn power_cycle_frame(device_groups: u32, short_address: u8) -> u32 {
    let mut frame = 0xfe_e000;
    if device_groups > 0 {
        frame |= 1 << 12;
        frame |= ((lowest_group(device_groups, 0) as u32) << 7) & 0xf80;
    }
    if short_address != 0xff {
        frame |= 1 << 6;
        frame |= (short_address as u32) & 0x3f;
    }
    frame
}

// Number of the lowest set group bit, counting from `start`.
fn lowest_group(groups: u32, start: u8) -> u8 {
    let mut rest = groups;
    let mut count = start;
    while rest != 0 && rest % 2 == 0 {
        rest >>= 1;
        count += 1;
    }
    count
}

/// Width of the no-event window around the last reported value.
pub fn band_width(hysteresis_min: u8, hysteresis: u8, value: u16) -> u32 {
    let relative = hysteresis as u32 * value as u32 / 100;
    (hysteresis_min as u32).max(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme0_layout() {
        let vars = DeviceVariables::defaults(10);
        let rom = RomVariables::default();
        let frame = event_frame(0, &vars, &rom, 550);
        // Instance type 4, instance number 1, value 550 >> 6.
        assert_eq!(frame, 0x80_0000 | (4 << 17) | 0x8000 | (1 << 10) | (550 >> 6));
        // Bit 16 clear marks an event frame.
        assert_eq!(frame & 0x01_0000, 0);
    }

    #[test]
    fn scheme3_uses_lowest_group() {
        let mut vars = DeviceVariables::defaults(10);
        vars.device_groups = 0b1100;
        let rom = RomVariables::default();
        let frame = event_frame(3, &vars, &rom, 0);
        assert_eq!((frame >> 17) & 0x1f, 3);
    }

    #[test]
    fn power_cycle_frame_encodes_address() {
        let frame = power_cycle_frame(0, 0xff);
        assert_eq!(frame, 0xfe_e000);
        let frame = power_cycle_frame(0b1000, 5);
        assert_eq!(frame & (1 << 12), 1 << 12);
        assert_eq!((frame >> 7) & 0x1f, 3);
        assert_eq!(frame & (1 << 6), 1 << 6);
        assert_eq!(frame & 0x3f, 5);
    }

    #[test]
    fn band_width_floors_at_minimum() {
        assert_eq!(band_width(10, 5, 500), 25);
        assert_eq!(band_width(10, 5, 100), 10);
        assert_eq!(band_width(0, 0, 1000), 0);
    }
}
