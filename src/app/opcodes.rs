//! Opcode tables of IEC 62386-103 and the part 303 input-device extras

use num_enum::TryFromPrimitive;

/// Address byte introducing a special command.
pub const SPECIAL_COMMAND: u8 = 0xc1;
/// Address byte of DIRECT WRITE MEMORY.
pub const DIRECT_WRITE_MEMORY: u8 = 0xc5;
/// Address byte loading DTR1 and DTR0 in one frame.
pub const SET_DTR1_DTR0: u8 = 0xc7;
/// Address byte loading DTR2 and DTR1 in one frame.
pub const SET_DTR2_DTR1: u8 = 0xc9;
/// Broadcast to unaddressed devices only.
pub const BROADCAST_UNADDRESSED: u8 = 0xfd;

/// Instance byte selecting device-level commands.
pub const INSTANCE_DEVICE: u8 = 0xfe;
/// Instance byte addressing every instance.
pub const INSTANCE_BROADCAST: u8 = 0xff;

/// Device-level commands (instance byte 0xFE).
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum DeviceOpcode {
    IdentifyDevice = 0x00,
    ResetPowerCycleSeen = 0x01,
    Reset = 0x10,
    ResetMemoryBank = 0x11,
    SetShortAddress = 0x14,
    EnableWriteMemory = 0x15,
    EnableApplicationController = 0x16,
    DisableApplicationController = 0x17,
    SetOperatingMode = 0x18,
    AddToDeviceGroups0 = 0x19,
    AddToDeviceGroups16 = 0x1a,
    RemoveFromDeviceGroups0 = 0x1b,
    RemoveFromDeviceGroups16 = 0x1c,
    StartQuiescentMode = 0x1d,
    StopQuiescentMode = 0x1e,
    EnablePowerCycleNotification = 0x1f,
    DisablePowerCycleNotification = 0x20,
    SavePersistentVariables = 0x21,
    QueryDeviceStatus = 0x30,
    QueryApplicationControllerError = 0x31,
    QueryInputDeviceError = 0x32,
    QueryMissingShortAddress = 0x33,
    QueryVersionNumber = 0x34,
    QueryNumberOfInstances = 0x35,
    QueryContentDtr0 = 0x36,
    QueryContentDtr1 = 0x37,
    QueryContentDtr2 = 0x38,
    QueryRandomAddressH = 0x39,
    QueryRandomAddressM = 0x3a,
    QueryRandomAddressL = 0x3b,
    ReadMemoryLocation = 0x3c,
    QueryApplicationControllerEnabled = 0x3d,
    QueryOperatingMode = 0x3e,
    QueryManufacturerSpecificMode = 0x3f,
    QueryQuiescentMode = 0x40,
    QueryDeviceGroups0 = 0x41,
    QueryDeviceGroups8 = 0x42,
    QueryDeviceGroups16 = 0x43,
    QueryDeviceGroups24 = 0x44,
    QueryPowerCycleNotification = 0x45,
    QueryDeviceCapabilities = 0x46,
    QueryExtendedVersionNumber = 0x47,
    QueryResetState = 0x48,
    QueryApplicationControllerAlwaysActive = 0x49,
    SetEventPriority = 0x61,
}

/// Instance-level commands, including the input-device additions in the
/// 0x30..=0x3F range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum InstanceOpcode {
    SetReportTimer = 0x30,
    SetHysteresis = 0x31,
    SetDeadtimeTimer = 0x32,
    SetHysteresisMin = 0x33,
    QueryHysteresisMin = 0x3c,
    QueryDeadtimeTimer = 0x3d,
    QueryReportTimer = 0x3e,
    QueryHysteresis = 0x3f,
    SetEventPriority = 0x61,
    EnableInstance = 0x62,
    DisableInstance = 0x63,
    SetPrimaryInstanceGroup = 0x64,
    SetInstanceGroup1 = 0x65,
    SetInstanceGroup2 = 0x66,
    SetEventScheme = 0x67,
    SetEventFilter = 0x68,
    QueryInstanceType = 0x80,
    QueryResolution = 0x81,
    QueryInstanceError = 0x82,
    QueryInstanceStatus = 0x83,
    QueryEventPriority = 0x84,
    QueryInstanceEnabled = 0x86,
    QueryPrimaryInstanceGroup = 0x88,
    QueryInstanceGroup1 = 0x89,
    QueryInstanceGroup2 = 0x8a,
    QueryEventScheme = 0x8b,
    QueryInputValue = 0x8c,
    QueryInputValueLatch = 0x8d,
    QueryFeatureType = 0x8e,
    QueryNextFeatureType = 0x8f,
    QueryEventFilter0 = 0x90,
    QueryEventFilter8 = 0x91,
    QueryEventFilter16 = 0x92,
}

/// Special commands (address byte 0xC1, selector in the instance byte).
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SpecialCommand {
    Terminate = 0x00,
    Initialise = 0x01,
    Randomise = 0x02,
    Compare = 0x03,
    Withdraw = 0x04,
    SearchAddrH = 0x05,
    SearchAddrM = 0x06,
    SearchAddrL = 0x07,
    ProgramShortAddress = 0x08,
    VerifyShortAddress = 0x09,
    QueryShortAddress = 0x0a,
    WriteMemoryLocation = 0x20,
    WriteMemoryLocationNoReply = 0x21,
    SetDtr0 = 0x30,
    SetDtr1 = 0x31,
    SetDtr2 = 0x32,
    SendTestframe = 0x33,
}

/// Device status bits answered by QUERY DEVICE STATUS.
pub mod status {
    pub const INPUT_DEVICE_ERROR: u8 = 0x01;
    pub const QUIESCENT_MODE: u8 = 0x02;
    pub const ADDRESS_MISSING: u8 = 0x04;
    pub const APPLICATION_ACTIVE: u8 = 0x08;
    pub const APPLICATION_CONTROLLER_ERROR: u8 = 0x10;
    pub const POWER_CYCLE_SEEN: u8 = 0x20;
    pub const RESET_STATE: u8 = 0x40;
}

/// Device capability bits answered by QUERY DEVICE CAPABILITIES.
pub mod capability {
    pub const CONTROLLER_PRESENT: u8 = 0x01;
    pub const INSTANCE_PRESENT: u8 = 0x02;
    pub const CONTROLLER_ALWAYS_ACTIVE: u8 = 0x04;
}

/// Instance error bits reported through QUERY INSTANCE ERROR.
pub mod instance_error {
    pub const SENSOR_FAILURE: u8 = 0x01;
    pub const MANUFACTURER_1: u8 = 0x10;
    pub const MANUFACTURER_2: u8 = 0x20;
    pub const MANUFACTURER_3: u8 = 0x40;
    pub const MANUFACTURER_4: u8 = 0x80;
}
