//! Application layer
//!
//! [`DaliDevice`] wraps a [`DaliLink`] and implements the part 103
//! control-device behaviour: addressing, send-twice gating of
//! state-changing commands, query replies, the memory-bank protocol, the
//! random-address commissioning dance, quiescent mode, power-cycle
//! notification and the hysteresis-driven input event dispatcher.
//!
//! The cooperative main loop calls [`DaliDevice::poll`] whenever the link
//! may have produced receive records, [`DaliDevice::tick_1ms`] from the
//! housekeeping tick and [`DaliDevice::update_input`] with fresh sensor
//! readings. The three interrupt entry points forward to the link.

pub mod opcodes;

mod events;

use core::convert::TryFrom;
use core::mem;

use crate::config::DeviceMode;
use crate::frame::{FrameKind, Priority, RxError, RxRecord, TxKind, TxRequest};
use crate::link::DaliLink;
use crate::line::Line;
use crate::memory::{MemoryStore, WriteOutcome};
use crate::nvm::{NvmError, NvmFlash};
use crate::timer::{BitTimer, EdgeTimer};
use crate::util::Xorshift32;
use crate::vars::{hysteresis_min_for, DeviceVariables, RomVariables};

use self::opcodes::{DeviceOpcode, InstanceOpcode, SpecialCommand};

/// State of the random-address commissioning sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitialisationState {
    /// Commissioning commands are ignored.
    Disabled,
    /// INITIALISE received; the 15-minute window is open.
    Enabled,
    /// WITHDRAW received; the device no longer answers COMPARE.
    Withdrawn,
}

/// A complete DALI-2 control device.
pub struct DaliDevice<L, BT, ET, N> {
    link: DaliLink<L, BT, ET>,
    store: MemoryStore<N>,
    vars: DeviceVariables,
    rom: RomVariables,

    search_address: u32,
    dtr0: u8,
    dtr1: u8,
    dtr2: u8,
    quiescent: bool,
    write_enable: bool,
    power_cycle_seen: bool,
    initialisation: InitialisationState,
    app_controller_error: bool,
    input_device_error: bool,
    reset_state: bool,
    instance_error: u8,

    input_value: u16,
    input_latch: u16,
    latch_byte: u8,
    band_high: u32,
    band_low: u32,

    previous_frame: Option<u32>,
    is_second_frame: bool,
    last_backward: Option<u8>,

    report_time_ms: u32,
    dead_time_ms: u32,
    power_notify_ms: u16,
    power_notify_due: bool,
    identify_ms: u16,
    quiescent_min: u8,
    initialise_min: u8,
    minute_ms: u16,

    rng: Xorshift32,
}

impl<L, BT, ET, N> DaliDevice<L, BT, ET, N>
where
    L: Line,
    BT: BitTimer,
    ET: EdgeTimer,
    N: NvmFlash,
{
    /// Brings the device up: provisions blank flash, loads the persisted
    /// variables (replacing fresh-silicon sentinels with the documented
    /// defaults) and configures the link role. `seed` feeds RANDOMISE.
    pub fn new(mut link: DaliLink<L, BT, ET>, nvm: N, seed: u32) -> Result<Self, NvmError> {
        let mut store = MemoryStore::new(nvm);
        store.init()?;
        let rom = match store.load_rom() {
            Some(rom) => rom,
            None => {
                let rom = RomVariables::default();
                store.save_rom(&rom)?;
                rom
            }
        };
        let vars = match store.load_variables() {
            Some(vars) => vars,
            None => {
                let vars = DeviceVariables::defaults(rom.resolution);
                store.save_variables(&vars)?;
                vars
            }
        };
        link.set_mode(if vars.application_active {
            DeviceMode::ApplicationController
        } else {
            DeviceMode::InputDevice
        });
        let power_notify_ms = if vars.power_cycle_notification { 1200 } else { 0 };
        Ok(DaliDevice {
            link,
            store,
            vars,
            rom,
            search_address: 0xff_ffff,
            dtr0: 0,
            dtr1: 0,
            dtr2: 0,
            quiescent: false,
            write_enable: false,
            power_cycle_seen: true,
            initialisation: InitialisationState::Disabled,
            app_controller_error: false,
            input_device_error: false,
            reset_state: true,
            instance_error: 0,
            input_value: 0,
            input_latch: 0,
            latch_byte: 0,
            band_high: 0,
            band_low: 0,
            previous_frame: None,
            is_second_frame: false,
            last_backward: None,
            report_time_ms: 0,
            dead_time_ms: 0,
            power_notify_ms,
            power_notify_due: false,
            identify_ms: 0,
            quiescent_min: 0,
            initialise_min: 0,
            minute_ms: 0,
            rng: Xorshift32::new(seed ^ 0x9e37_79b9),
        })
    }

    /// Tears the device down, releasing the link and the flash.
    pub fn free(self) -> (DaliLink<L, BT, ET>, N) {
        (self.link, self.store.free())
    }

    /// Bit-timer expiry interrupt.
    pub fn on_bit_tick(&mut self) {
        self.link.on_bit_tick();
    }

    /// RX edge interrupt.
    pub fn on_edge(&mut self) {
        self.link.on_edge();
    }

    /// 1 kHz housekeeping: cable monitor and the soft timers.
    pub fn tick_1ms(&mut self) {
        self.link.tick_1khz();
        if self.report_time_ms > 0 {
            self.report_time_ms -= 1;
        }
        if self.dead_time_ms > 0 {
            self.dead_time_ms -= 1;
        }
        if self.identify_ms > 0 {
            self.identify_ms -= 1;
        }
        if self.power_notify_ms > 0 {
            self.power_notify_ms -= 1;
            if self.power_notify_ms == 0 {
                self.power_notify_due = true;
            }
        }
        self.minute_ms += 1;
        if self.minute_ms >= 60_000 {
            self.minute_ms = 0;
            if self.quiescent_min > 0 {
                self.quiescent_min -= 1;
                if self.quiescent_min == 0 {
                    self.quiescent = false;
                }
            }
            if self.initialise_min > 0 {
                self.initialise_min -= 1;
                if self.initialise_min == 0 {
                    self.initialisation = InitialisationState::Disabled;
                }
            }
        }
    }

    /// Drains the receive queue and runs due notifications. Call from
    /// the main loop whenever the link may have produced records.
    pub fn poll(&mut self) {
        if mem::take(&mut self.power_notify_due) {
            self.send_power_cycle_event();
        }
        while let Ok(record) = self.link.receive() {
            self.process_record(record);
        }
    }

    /// Stores a fresh input value without touching the event machinery.
    pub fn set_input_value(&mut self, value: u16) {
        self.input_value = value;
    }

    /// Stores a fresh input value and runs the event dispatcher.
    pub fn update_input(&mut self, value: u16) {
        self.input_value = value;
        self.maybe_send_event();
    }

    /// Converts a raw ADC reading through the bank 189 calibration into
    /// the MSB-aligned input value and runs the event dispatcher.
    ///
    /// The reading is scaled so that the calibration offset maps to 0
    /// and sixteen times the calibration scale maps to the bank's
    /// full-scale range; the low bits repeat the upper bits of the
    /// result.
    pub fn update_input_from_adc(&mut self, adc: u16) {
        let offset = self.store.calibration_offset() as u32;
        let scale = self.store.calibration_scale() as u32;
        let full_scale = self.store.full_scale_range() as u32;
        let denom = (16 * scale).saturating_sub(offset).max(1);
        let v10 = (full_scale * (adc as u32).saturating_sub(offset) / denom).min(0x3ff);
        self.update_input(((v10 << 6) | (v10 >> 4)) as u16);
    }

    /// Latches an instance error condition (for example an ADC timeout).
    /// A non-zero error byte also suppresses event generation.
    pub fn set_instance_error(&mut self, bits: u8) {
        self.instance_error = bits;
    }

    /// Current instance error byte.
    pub fn instance_error(&self) -> u8 {
        self.instance_error
    }

    /// Whether an IDENTIFY DEVICE window is running, for the indicator.
    pub fn identifying(&self) -> bool {
        self.identify_ms > 0
    }

    /// Commissioning state, for diagnostics.
    pub fn initialisation_state(&self) -> InitialisationState {
        self.initialisation
    }

    /// Whether quiescent mode is active.
    pub fn quiescent_mode(&self) -> bool {
        self.quiescent
    }

    /// Whether every variable still holds its reset default.
    pub fn reset_state(&self) -> bool {
        self.reset_state
    }

    /// Current short address (0xFF when unaddressed).
    pub fn short_address(&self) -> u8 {
        self.vars.short_address
    }

    /// Current random address.
    pub fn random_address(&self) -> u32 {
        self.vars.random_address
    }

    /// Data transfer registers, for diagnostics.
    pub fn dtr(&self) -> (u8, u8, u8) {
        (self.dtr0, self.dtr1, self.dtr2)
    }

    /// Most recent backward frame observed on the bus.
    pub fn last_backward(&self) -> Option<u8> {
        self.last_backward
    }

    /// Direct access to the link layer.
    pub fn link(&mut self) -> &mut DaliLink<L, BT, ET> {
        &mut self.link
    }

    /// Direct access to the memory-bank store.
    pub fn store(&mut self) -> &mut MemoryStore<N> {
        &mut self.store
    }

    fn process_record(&mut self, record: RxRecord) {
        if !record.done || record.error != RxError::None {
            // Malformed traffic is counted by the link flags; it never
            // takes part in send-twice matching.
            return;
        }
        match record.kind {
            FrameKind::Backward8 => self.last_backward = Some(record.frame as u8),
            _ => self.process_forward(record.frame, record.send_twice_possible),
        }
    }

    fn process_forward(&mut self, frame: u32, twice_possible: bool) {
        if frame & 0x01_0000 == 0 {
            // Event frames from other devices carry no commands for us.
            return;
        }
        let address = (frame >> 16) as u8;
        let instance = (frame >> 8) as u8;
        let opcode = frame as u8;

        if address < 0x80 {
            // Short addressing; the low bit marks a command frame.
            if address != self.vars.short_address.wrapping_mul(2).wrapping_add(1) {
                return;
            }
        } else if address < 0xc0 {
            let group = (address >> 1) & 0x1f;
            if self.vars.device_groups & (1 << group) == 0 {
                return;
            }
        } else if address == opcodes::BROADCAST_UNADDRESSED {
            if self.vars.short_address != 0xff {
                return;
            }
        } else if address > 0xe0 && address < opcodes::BROADCAST_UNADDRESSED {
            // Reserved addressing.
            return;
        } else if address == opcodes::SPECIAL_COMMAND {
            self.process_special(frame, instance, opcode, twice_possible);
            return;
        } else if address == opcodes::DIRECT_WRITE_MEMORY {
            if self.write_enable {
                self.dtr0 = instance;
                self.write_memory(opcode, true);
            }
            self.previous_frame = Some(frame);
            return;
        } else if address == opcodes::SET_DTR1_DTR0 {
            self.dtr1 = instance;
            self.dtr0 = opcode;
            self.previous_frame = Some(frame);
            return;
        } else if address == opcodes::SET_DTR2_DTR1 {
            self.dtr2 = instance;
            self.dtr1 = opcode;
            self.previous_frame = Some(frame);
            return;
        }

        let memory_related = if instance == opcodes::INSTANCE_DEVICE {
            self.device_command(frame, opcode, twice_possible)
        } else if self.instance_addressed(instance) {
            self.instance_command(frame, opcode, twice_possible);
            false
        } else {
            false
        };

        // The write-enable window survives memory-related commands only.
        if !memory_related {
            self.write_enable = false;
        }
        self.previous_frame = if self.is_second_frame {
            None
        } else {
            Some(frame)
        };
        self.is_second_frame = false;
    }

    // Send-twice gate. The first copy arms the 100 ms window at the
    // link; the identical second copy returns true when it arrived
    // inside a window the link has marked as such.
    fn second_of_twice(&mut self, frame: u32, possible: bool) -> bool {
        if self.previous_frame != Some(frame) {
            self.link.expect_send_twice();
            false
        } else {
            self.is_second_frame = true;
            possible
        }
    }

    fn instance_addressed(&self, instance: u8) -> bool {
        instance == opcodes::INSTANCE_BROADCAST
            || instance == self.rom.instance_number
            || instance == 0xc0u8.wrapping_add(self.rom.instance_type)
            || (self.vars.instance_group0 < 0xff
                && instance == 0x80u8.wrapping_add(self.vars.instance_group0))
            || (self.vars.instance_group1 < 0xff
                && instance == 0x80u8.wrapping_add(self.vars.instance_group1))
            || (self.vars.instance_group2 < 0xff
                && instance == 0x80u8.wrapping_add(self.vars.instance_group2))
    }

    fn process_special(&mut self, frame: u32, instance: u8, opcode: u8, twice_possible: bool) {
        if let Ok(cmd) = SpecialCommand::try_from(instance) {
            match cmd {
                SpecialCommand::Terminate => {
                    if opcode == 0 {
                        self.initialisation = InitialisationState::Disabled;
                        self.initialise_min = 0;
                    }
                }
                SpecialCommand::Initialise => {
                    if self.second_of_twice(frame, twice_possible) {
                        let addressed = (opcode == 0x7f && self.vars.short_address == 0xff)
                            || opcode == 0xff
                            || (opcode < 64 && opcode == self.vars.short_address);
                        if addressed {
                            self.initialisation = InitialisationState::Enabled;
                            self.initialise_min = 15;
                        }
                    }
                }
                SpecialCommand::Randomise => {
                    if self.second_of_twice(frame, twice_possible)
                        && self.initialisation != InitialisationState::Disabled
                        && opcode == 0
                    {
                        self.vars.random_address = self.rng.next() & 0xff_ffff;
                        self.save_variables();
                        if self.vars.random_address != 0xff_ffff {
                            self.reset_state = false;
                        }
                    }
                }
                SpecialCommand::Compare => {
                    if self.initialisation == InitialisationState::Enabled
                        && self.vars.random_address <= self.search_address
                        && opcode == 0
                    {
                        self.reply(0xff);
                    }
                }
                SpecialCommand::Withdraw => {
                    if self.initialisation == InitialisationState::Enabled
                        && self.vars.random_address == self.search_address
                        && opcode == 0
                    {
                        self.initialisation = InitialisationState::Withdrawn;
                    }
                }
                SpecialCommand::SearchAddrH => {
                    if self.initialisation != InitialisationState::Disabled {
                        self.search_address =
                            ((opcode as u32) << 16) | (self.search_address & 0x00_ffff);
                    }
                }
                SpecialCommand::SearchAddrM => {
                    if self.initialisation != InitialisationState::Disabled {
                        self.search_address =
                            ((opcode as u32) << 8) | (self.search_address & 0xff_00ff);
                    }
                }
                SpecialCommand::SearchAddrL => {
                    if self.initialisation != InitialisationState::Disabled {
                        self.search_address = (opcode as u32) | (self.search_address & 0xff_ff00);
                    }
                }
                SpecialCommand::ProgramShortAddress => {
                    if self.initialisation != InitialisationState::Disabled
                        && self.vars.random_address == self.search_address
                        && opcode < 64
                    {
                        self.vars.short_address = opcode;
                        self.save_variables();
                    }
                }
                SpecialCommand::VerifyShortAddress => {
                    if self.initialisation != InitialisationState::Disabled
                        && self.vars.short_address == opcode
                    {
                        self.reply(0xff);
                    }
                }
                SpecialCommand::QueryShortAddress => {
                    if self.initialisation != InitialisationState::Disabled
                        && self.vars.random_address == self.search_address
                        && opcode == 0
                    {
                        let answer = self.vars.short_address;
                        self.reply(answer);
                    }
                }
                SpecialCommand::WriteMemoryLocation => {
                    if self.write_enable {
                        self.write_memory(opcode, true);
                    }
                }
                SpecialCommand::WriteMemoryLocationNoReply => {
                    if self.write_enable {
                        self.write_memory(opcode, false);
                    }
                }
                SpecialCommand::SetDtr0 => self.dtr0 = opcode,
                SpecialCommand::SetDtr1 => self.dtr1 = opcode,
                SpecialCommand::SetDtr2 => self.dtr2 = opcode,
                SpecialCommand::SendTestframe => self.send_testframe(opcode),
            }
        }
        self.previous_frame = if self.is_second_frame {
            None
        } else {
            Some(frame)
        };
        self.is_second_frame = false;
    }

    fn send_testframe(&mut self, opcode: u8) {
        if opcode <= 0x7f {
            return;
        }
        let raw_priority = opcode & 0x07;
        let priority = match Priority::try_from(raw_priority) {
            Ok(priority) => priority,
            Err(_) => return,
        };
        if opcode & 0x20 != 0 && !self.rom.controller_present {
            return;
        }
        let frame = if opcode & 0x20 == 0 {
            ((self.dtr0 as u32) << 16) | ((self.dtr1 as u32) << 8) | self.dtr2 as u32
        } else {
            ((self.dtr0 as u32) << 8) | self.dtr1 as u32
        };
        let request = TxRequest {
            frame,
            kind: TxKind::Forward,
            send_twice: false,
            priority,
        };
        let _ = self.link.send(request);
        let mut repeat = (opcode >> 3) & 0x03;
        while repeat > 0 {
            let _ = self.link.send(request);
            repeat -= 1;
        }
    }

    fn device_command(&mut self, frame: u32, opcode: u8, twice_possible: bool) -> bool {
        let op = match DeviceOpcode::try_from(opcode) {
            Ok(op) => op,
            Err(_) => return false,
        };
        let mut memory_related = false;
        match op {
            DeviceOpcode::IdentifyDevice => {
                if self.second_of_twice(frame, twice_possible) {
                    self.identify_ms = 10_000;
                }
            }
            DeviceOpcode::ResetPowerCycleSeen => {
                if self.second_of_twice(frame, twice_possible) {
                    self.power_cycle_seen = false;
                }
            }
            DeviceOpcode::Reset => {
                if self.second_of_twice(frame, twice_possible) {
                    self.reset_variables();
                }
            }
            DeviceOpcode::ResetMemoryBank => {
                if self.store.reset(self.dtr0).is_err() {
                    self.input_device_error = true;
                }
            }
            DeviceOpcode::SetShortAddress => {
                if self.second_of_twice(frame, twice_possible)
                    && (self.dtr0 == 0xff || self.dtr0 < 0x40)
                {
                    self.vars.short_address = self.dtr0;
                    self.save_variables();
                }
            }
            DeviceOpcode::EnableWriteMemory => {
                if self.second_of_twice(frame, twice_possible) {
                    self.write_enable = true;
                    memory_related = true;
                }
            }
            DeviceOpcode::EnableApplicationController => {
                if self.second_of_twice(frame, twice_possible) && self.rom.controller_present {
                    self.vars.application_active = true;
                    self.link.set_mode(DeviceMode::ApplicationController);
                    self.save_variables();
                }
            }
            DeviceOpcode::DisableApplicationController => {
                if self.second_of_twice(frame, twice_possible)
                    && !self.rom.controller_always_active
                    && self.rom.controller_present
                {
                    self.vars.application_active = false;
                    self.link.set_mode(DeviceMode::InputDevice);
                    self.save_variables();
                }
            }
            DeviceOpcode::SetOperatingMode => {
                // Only the default operating mode is implemented.
                self.second_of_twice(frame, twice_possible);
            }
            DeviceOpcode::AddToDeviceGroups0 => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.device_groups |=
                        ((self.dtr2 as u32) << 8) | self.dtr1 as u32;
                    self.groups_changed();
                }
            }
            DeviceOpcode::AddToDeviceGroups16 => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.device_groups |=
                        ((self.dtr2 as u32) << 24) | ((self.dtr1 as u32) << 16);
                    self.groups_changed();
                }
            }
            DeviceOpcode::RemoveFromDeviceGroups0 => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.device_groups &=
                        !((self.dtr2 as u32) << 8) & !(self.dtr1 as u32);
                    self.groups_changed();
                }
            }
            DeviceOpcode::RemoveFromDeviceGroups16 => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.device_groups &=
                        !((self.dtr2 as u32) << 24) & !((self.dtr1 as u32) << 16);
                    self.groups_changed();
                }
            }
            DeviceOpcode::StartQuiescentMode => {
                if self.second_of_twice(frame, twice_possible) {
                    self.quiescent = true;
                    self.quiescent_min = 15;
                }
            }
            DeviceOpcode::StopQuiescentMode => {
                if self.second_of_twice(frame, twice_possible) {
                    self.quiescent = false;
                    self.quiescent_min = 0;
                }
            }
            DeviceOpcode::EnablePowerCycleNotification => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.power_cycle_notification = true;
                    self.save_variables();
                }
            }
            DeviceOpcode::DisablePowerCycleNotification => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.power_cycle_notification = false;
                    self.save_variables();
                }
            }
            DeviceOpcode::SavePersistentVariables => {
                if self.second_of_twice(frame, twice_possible) {
                    self.save_variables();
                }
            }
            DeviceOpcode::QueryDeviceStatus => {
                let mut answer = 0u8;
                if self.vars.application_active {
                    answer |= opcodes::status::APPLICATION_ACTIVE;
                }
                if self.input_device_error {
                    answer |= opcodes::status::INPUT_DEVICE_ERROR;
                }
                if self.quiescent {
                    answer |= opcodes::status::QUIESCENT_MODE;
                }
                if self.vars.short_address == 0xff {
                    answer |= opcodes::status::ADDRESS_MISSING;
                }
                if self.app_controller_error {
                    answer |= opcodes::status::APPLICATION_CONTROLLER_ERROR;
                }
                if self.power_cycle_seen {
                    answer |= opcodes::status::POWER_CYCLE_SEEN;
                }
                if self.reset_state {
                    answer |= opcodes::status::RESET_STATE;
                }
                self.reply(answer);
            }
            DeviceOpcode::QueryDeviceCapabilities => {
                let mut answer = 0u8;
                if self.rom.controller_always_active {
                    answer |= opcodes::capability::CONTROLLER_ALWAYS_ACTIVE;
                }
                if self.rom.controller_present {
                    answer |= opcodes::capability::CONTROLLER_PRESENT;
                }
                if self.rom.number_of_instances > 0 {
                    answer |= opcodes::capability::INSTANCE_PRESENT;
                }
                self.reply(answer);
            }
            DeviceOpcode::QueryApplicationControllerError => {}
            DeviceOpcode::QueryInputDeviceError => {
                if self.instance_error != 0 {
                    let answer = self.instance_error;
                    self.reply(answer);
                }
            }
            DeviceOpcode::QueryMissingShortAddress => {
                if self.vars.short_address == 0xff {
                    self.reply(0xff);
                }
            }
            DeviceOpcode::QueryVersionNumber => {
                if let Some(answer) = self.store.read(0, crate::memory::bank0::VERSION_103) {
                    self.reply(answer);
                }
            }
            DeviceOpcode::QueryContentDtr0 => {
                memory_related = true;
                let answer = self.dtr0;
                self.reply(answer);
            }
            DeviceOpcode::QueryContentDtr1 => {
                memory_related = true;
                let answer = self.dtr1;
                self.reply(answer);
            }
            DeviceOpcode::QueryContentDtr2 => {
                memory_related = true;
                let answer = self.dtr2;
                self.reply(answer);
            }
            DeviceOpcode::QueryNumberOfInstances => {
                let answer = self.rom.number_of_instances;
                self.reply(answer);
            }
            DeviceOpcode::QueryRandomAddressH => {
                let answer = (self.vars.random_address >> 16) as u8;
                self.reply(answer);
            }
            DeviceOpcode::QueryRandomAddressM => {
                let answer = (self.vars.random_address >> 8) as u8;
                self.reply(answer);
            }
            DeviceOpcode::QueryRandomAddressL => {
                let answer = self.vars.random_address as u8;
                self.reply(answer);
            }
            DeviceOpcode::ReadMemoryLocation => {
                match self.store.read(self.dtr1, self.dtr0) {
                    Some(answer) => {
                        self.reply(answer);
                        if self.dtr0 < 0xff {
                            self.dtr0 += 1;
                        }
                    }
                    None => {
                        if self.dtr1 == 0 || self.dtr1 == 189 {
                            self.dtr0 = self.dtr0.saturating_add(1);
                        }
                    }
                }
            }
            DeviceOpcode::QueryApplicationControllerEnabled => {
                if self.vars.application_active {
                    self.reply(0xff);
                }
            }
            DeviceOpcode::QueryOperatingMode => {
                let answer = self.vars.operating_mode;
                self.reply(answer);
            }
            DeviceOpcode::QueryManufacturerSpecificMode => {
                if self.vars.operating_mode > 0x80 {
                    self.reply(0xff);
                }
            }
            DeviceOpcode::QueryQuiescentMode => {
                if self.quiescent {
                    self.reply(0xff);
                }
            }
            DeviceOpcode::QueryDeviceGroups0 => {
                let answer = self.vars.device_groups as u8;
                self.reply(answer);
            }
            DeviceOpcode::QueryDeviceGroups8 => {
                let answer = (self.vars.device_groups >> 8) as u8;
                self.reply(answer);
            }
            DeviceOpcode::QueryDeviceGroups16 => {
                let answer = (self.vars.device_groups >> 16) as u8;
                self.reply(answer);
            }
            DeviceOpcode::QueryDeviceGroups24 => {
                let answer = (self.vars.device_groups >> 24) as u8;
                self.reply(answer);
            }
            DeviceOpcode::QueryPowerCycleNotification => {
                if self.vars.power_cycle_notification {
                    self.reply(0xff);
                }
            }
            DeviceOpcode::QueryExtendedVersionNumber => {
                if self.dtr0 == 4 {
                    let answer = self.rom.extended_version_number;
                    self.reply(answer);
                }
            }
            DeviceOpcode::QueryResetState => {
                self.check_reset_state();
                if self.reset_state {
                    self.reply(0xff);
                }
            }
            DeviceOpcode::QueryApplicationControllerAlwaysActive => {
                if self.rom.controller_always_active {
                    self.reply(0xff);
                }
            }
            DeviceOpcode::SetEventPriority => {
                if self.second_of_twice(frame, twice_possible) {
                    self.set_event_priority_from_dtr0();
                }
            }
        }
        memory_related
    }

    fn instance_command(&mut self, frame: u32, opcode: u8, twice_possible: bool) {
        let op = match InstanceOpcode::try_from(opcode) {
            Ok(op) => op,
            Err(_) => return,
        };
        match op {
            InstanceOpcode::EnableInstance => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.instance_active = true;
                    self.save_variables();
                }
            }
            InstanceOpcode::DisableInstance => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.instance_active = false;
                    self.save_variables();
                }
            }
            InstanceOpcode::SetPrimaryInstanceGroup => {
                if self.second_of_twice(frame, twice_possible)
                    && (self.dtr0 < 32 || self.dtr0 == 0xff)
                {
                    self.vars.instance_group0 = self.dtr0;
                    self.save_variables();
                    if self.vars.instance_group0 != 0xff {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::SetInstanceGroup1 => {
                if self.second_of_twice(frame, twice_possible)
                    && (self.dtr0 < 32 || self.dtr0 == 0xff)
                {
                    self.vars.instance_group1 = self.dtr0;
                    self.save_variables();
                    if self.vars.instance_group1 != 0xff {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::SetInstanceGroup2 => {
                if self.second_of_twice(frame, twice_possible)
                    && (self.dtr0 < 32 || self.dtr0 == 0xff)
                {
                    self.vars.instance_group2 = self.dtr0;
                    self.save_variables();
                    if self.vars.instance_group2 != 0xff {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::SetEventPriority => {
                if self.second_of_twice(frame, twice_possible) {
                    self.set_event_priority_from_dtr0();
                }
            }
            InstanceOpcode::SetEventScheme => {
                if self.second_of_twice(frame, twice_possible) && self.dtr0 < 5 {
                    self.vars.event_scheme = self.dtr0;
                    self.save_variables();
                    if self.vars.event_scheme != 0 {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::SetEventFilter => {
                if self.second_of_twice(frame, twice_possible) {
                    if self.vars.application_active {
                        self.vars.event_filter = ((self.dtr2 as u32) << 16)
                            | ((self.dtr1 as u32) << 8)
                            | self.dtr0 as u32;
                        self.save_variables();
                        if self.vars.event_filter != 0xff_ffff {
                            self.reset_state = false;
                        }
                    } else {
                        if self.dtr0 < 2 {
                            self.vars.event_filter = self.dtr0 as u32;
                            self.save_variables();
                        }
                        if self.vars.event_filter != 1 {
                            self.reset_state = false;
                        }
                    }
                }
            }
            InstanceOpcode::QueryInstanceType => {
                let answer = self.rom.instance_type;
                self.reply(answer);
            }
            InstanceOpcode::QueryResolution => {
                let answer = self.rom.resolution;
                self.reply(answer);
            }
            InstanceOpcode::QueryInstanceStatus => {
                let answer = (((self.instance_error != 0) as u8) << 7)
                    | ((self.vars.instance_active as u8) << 6);
                self.reply(answer);
            }
            InstanceOpcode::QueryInstanceEnabled => {
                if self.vars.instance_active {
                    self.reply(0xff);
                }
            }
            InstanceOpcode::QueryInstanceError => {
                if self.instance_error != 0 {
                    let answer = self.instance_error;
                    self.reply(answer);
                }
            }
            InstanceOpcode::QueryPrimaryInstanceGroup => {
                let answer = self.vars.instance_group0;
                self.reply(answer);
            }
            InstanceOpcode::QueryInstanceGroup1 => {
                let answer = self.vars.instance_group1;
                self.reply(answer);
            }
            InstanceOpcode::QueryInstanceGroup2 => {
                let answer = self.vars.instance_group2;
                self.reply(answer);
            }
            InstanceOpcode::QueryEventScheme => {
                let answer = self.vars.event_scheme;
                self.reply(answer);
            }
            InstanceOpcode::QueryEventPriority => {
                let answer = self.vars.event_priority;
                self.reply(answer);
            }
            InstanceOpcode::QueryInputValue => {
                self.input_latch = self.input_value;
                self.latch_byte = (self.rom.resolution + 7) / 8 - 1;
                let answer = (self.input_latch >> (self.latch_byte as u16 * 8)) as u8;
                self.reply(answer);
            }
            InstanceOpcode::QueryInputValueLatch => {
                if self.latch_byte != 0 {
                    self.latch_byte -= 1;
                    let answer = (self.input_latch >> (self.latch_byte as u16 * 8)) as u8;
                    self.reply(answer);
                }
            }
            InstanceOpcode::QueryFeatureType => {}
            InstanceOpcode::QueryNextFeatureType => {}
            InstanceOpcode::QueryEventFilter0 => {
                let answer = self.vars.event_filter as u8;
                self.reply(answer);
            }
            InstanceOpcode::QueryEventFilter8 => {
                let answer = (self.vars.event_filter >> 8) as u8;
                self.reply(answer);
            }
            InstanceOpcode::QueryEventFilter16 => {
                let answer = (self.vars.event_filter >> 16) as u8;
                self.reply(answer);
            }
            InstanceOpcode::SetReportTimer => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.t_report = self.dtr0;
                    if self.vars.t_report != 30 {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::SetHysteresis => {
                if self.second_of_twice(frame, twice_possible) && self.dtr0 <= 25 {
                    self.vars.hysteresis = self.dtr0;
                    if self.vars.hysteresis != 5 {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::SetDeadtimeTimer => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.t_deadtime = self.dtr0;
                    if self.vars.t_deadtime != 30 {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::SetHysteresisMin => {
                if self.second_of_twice(frame, twice_possible) {
                    self.vars.hysteresis_min = self.dtr0;
                    if self.vars.hysteresis_min != 10 {
                        self.reset_state = false;
                    }
                }
            }
            InstanceOpcode::QueryReportTimer => {
                let answer = self.vars.t_report;
                self.reply(answer);
            }
            InstanceOpcode::QueryDeadtimeTimer => {
                let answer = self.vars.t_deadtime;
                self.reply(answer);
            }
            InstanceOpcode::QueryHysteresis => {
                let answer = self.vars.hysteresis;
                self.reply(answer);
            }
            InstanceOpcode::QueryHysteresisMin => {
                let answer = self.vars.hysteresis_min;
                self.reply(answer);
            }
        }
    }

    fn set_event_priority_from_dtr0(&mut self) {
        if self.dtr0 > 1 && self.dtr0 < 6 {
            self.vars.event_priority = self.dtr0;
            self.save_variables();
            if self.vars.event_priority != 4 {
                self.reset_state = false;
            }
        }
    }

    fn groups_changed(&mut self) {
        self.save_variables();
        if self.vars.device_groups != 0 {
            self.reset_state = false;
        }
    }

    fn write_memory(&mut self, data: u8, with_reply: bool) {
        match self.store.write(self.dtr1, self.dtr0, data) {
            WriteOutcome::NotAllowed => {}
            outcome => {
                if with_reply {
                    self.reply(data);
                }
                if outcome == WriteOutcome::RequiresPersist
                    && self.store.persist(self.dtr1, self.dtr0, data).is_err()
                {
                    self.input_device_error = true;
                }
            }
        }
        if self.dtr0 < 0xff && self.dtr1 == 189 {
            self.dtr0 += 1;
        }
    }

    // Event dispatcher. A fresh value outside the hysteresis band emits
    // immediately; inside the band the report timer paces periodic
    // re-reports. Each emission recentres the band and restarts both the
    // report timer and the dead time.
    fn maybe_send_event(&mut self) {
        if self.vars.application_active
            || self.quiescent
            || self.dead_time_ms != 0
            || self.vars.event_filter & 1 == 0
            || !self.vars.instance_active
            || self.instance_error != 0
        {
            return;
        }
        let fallback = match self.vars.event_scheme {
            1 | 2 => self.vars.short_address == 0xff,
            3 => self.vars.device_groups == 0,
            4 => self.vars.instance_group0 == 0xff,
            _ => false,
        };
        if fallback {
            self.vars.event_scheme = 0;
            self.save_variables();
        }
        let frame = events::event_frame(
            self.vars.event_scheme,
            &self.vars,
            &self.rom,
            self.input_value,
        );
        let value = self.input_value as u32;
        let outside = value > self.band_high || value < self.band_low;
        let periodic = self.report_time_ms == 0 && self.vars.t_report != 0;
        if !outside && !periodic {
            return;
        }
        let request = TxRequest {
            frame,
            kind: TxKind::Forward,
            send_twice: false,
            priority: self.event_priority(),
        };
        let _ = self.link.send(request);
        if outside {
            let band =
                events::band_width(self.vars.hysteresis_min, self.vars.hysteresis, self.input_value);
            self.band_low = value.saturating_sub(band);
            self.band_high = value + band;
        }
        self.report_time_ms = self.vars.t_report as u32 * 1000;
        self.dead_time_ms = self.vars.t_deadtime as u32 * 1000;
    }

    fn send_power_cycle_event(&mut self) {
        let frame = events::power_cycle_frame(self.vars.device_groups, self.vars.short_address);
        let request = TxRequest {
            frame,
            kind: TxKind::Forward,
            send_twice: false,
            priority: Priority::P3,
        };
        let _ = self.link.send(request);
    }

    fn event_priority(&self) -> Priority {
        Priority::try_from(self.vars.event_priority).unwrap_or(Priority::P4)
    }

    fn reply(&mut self, answer: u8) {
        let _ = self.link.send(TxRequest::backframe(answer));
    }

    fn save_variables(&mut self) {
        if self.store.save_variables(&self.vars).is_err() {
            self.input_device_error = true;
        }
    }

    fn reset_variables(&mut self) {
        self.vars.device_groups = 0;
        self.search_address = 0xff_ffff;
        self.vars.random_address = 0xff_ffff;
        self.quiescent = false;
        self.quiescent_min = 0;
        self.write_enable = false;
        self.power_cycle_seen = false;
        self.reset_state = true;
        self.vars.instance_group0 = 0xff;
        self.vars.instance_group1 = 0xff;
        self.vars.instance_group2 = 0xff;
        self.vars.event_priority = 4;
        self.vars.event_scheme = 0;
        if self.vars.application_active {
            self.vars.event_filter = 0xffff;
        } else {
            self.vars.event_filter = 1;
            self.vars.t_report = 30;
            self.vars.t_deadtime = 30;
            self.vars.hysteresis = 5;
            self.vars.hysteresis_min = hysteresis_min_for(self.rom.resolution);
        }
        self.save_variables();
    }

    fn check_reset_state(&mut self) {
        if self.reset_state {
            return;
        }
        let vars = &self.vars;
        let at_defaults = vars.device_groups == 0
            && self.search_address == 0xff_ffff
            && vars.instance_group0 == 0xff
            && vars.instance_group1 == 0xff
            && vars.instance_group2 == 0xff
            && vars.event_filter == 1
            && vars.event_scheme == 0
            && vars.event_priority == 4
            && vars.t_report == 30
            && vars.t_deadtime == 30
            && vars.hysteresis_min == hysteresis_min_for(self.rom.resolution)
            && vars.hysteresis == 5;
        if at_defaults {
            self.reset_state = true;
        }
    }
}
