//! Persistent variables
//!
//! Two variable sets live in flash: the writable set changed by bus
//! commands and the factory set written once at provisioning. Both are
//! marshalled whole into their page; a page that fails to demarshal
//! (fresh silicon reads all 0xFF) yields the documented defaults, which
//! the first boot writes back.

use serde::{Deserialize, Serialize};

/// Variables on the writable page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceVariables {
    /// Group membership, one bit per device group 0..=31.
    pub device_groups: u32,
    /// 24-bit address drawn by RANDOMISE, 0xFFFFFF when never drawn.
    pub random_address: u32,
    /// Short address 0..=63, 0xFF when unaddressed.
    pub short_address: u8,
    /// Operating mode; values above 0x80 are manufacturer-specific.
    pub operating_mode: u8,
    /// The application-controller role is active.
    pub application_active: bool,
    /// Send a power-cycle event after boot.
    pub power_cycle_notification: bool,
    /// Event transmission priority, 2..=5.
    pub event_priority: u8,
    /// Primary instance group, 0xFF when unassigned.
    pub instance_group0: u8,
    /// Instance group 1, 0xFF when unassigned.
    pub instance_group1: u8,
    /// Instance group 2, 0xFF when unassigned.
    pub instance_group2: u8,
    /// The instance reports events and answers queries.
    pub instance_active: bool,
    /// Event filter bits; bit 0 enables input notifications.
    pub event_filter: u32,
    /// Event addressing scheme 0..=4.
    pub event_scheme: u8,
    /// Report interval in seconds; 0 disables periodic reports.
    pub t_report: u8,
    /// Dead time between events in seconds.
    pub t_deadtime: u8,
    /// Lower bound of the hysteresis band.
    pub hysteresis_min: u8,
    /// Hysteresis in percent of the current value, 0..=25.
    pub hysteresis: u8,
}

impl DeviceVariables {
    /// Reset values per IEC 62386-103, with the hysteresis floor keyed on
    /// the instance resolution.
    pub fn defaults(resolution: u8) -> Self {
        DeviceVariables {
            device_groups: 0,
            random_address: 0xff_ffff,
            short_address: 0xff,
            operating_mode: 0,
            application_active: false,
            power_cycle_notification: false,
            event_priority: 4,
            instance_group0: 0xff,
            instance_group1: 0xff,
            instance_group2: 0xff,
            instance_active: true,
            event_filter: 1,
            event_scheme: 0,
            t_report: 30,
            t_deadtime: 30,
            hysteresis_min: hysteresis_min_for(resolution),
            hysteresis: 5,
        }
    }
}

/// Variables on the factory page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RomVariables {
    /// Instances implemented by this device.
    pub number_of_instances: u8,
    /// An application controller is built in.
    pub controller_present: bool,
    /// The controller cannot be disabled.
    pub controller_always_active: bool,
    /// Part 103 version number; 9 encodes version 2.1.
    pub version_number: u8,
    /// Extended version number of the instance type.
    pub extended_version_number: u8,
    /// Instance type; 4 is a light sensor.
    pub instance_type: u8,
    /// Input value resolution in bits.
    pub resolution: u8,
    /// Instance number of the single instance.
    pub instance_number: u8,
}

impl Default for RomVariables {
    fn default() -> Self {
        RomVariables {
            number_of_instances: 1,
            controller_present: false,
            controller_always_active: false,
            version_number: 9,
            extended_version_number: 8,
            instance_type: 4,
            resolution: 10,
            instance_number: 1,
        }
    }
}

/// Smallest permitted hysteresis band, keyed on the input resolution.
pub fn hysteresis_min_for(resolution: u8) -> u8 {
    match resolution {
        0..=6 => 0,
        7 => 1,
        8 => 2,
        9 => 5,
        10 => 10,
        11 => 20,
        12 => 40,
        13 => 81,
        14 => 163,
        _ => 255,
    }
}
