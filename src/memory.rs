//! Memory banks
//!
//! Bank 0 identifies the device and is read-only on the bus. Bank 189
//! carries the writable sensor configuration behind two gates: the RAM
//! lock byte (writes need the 0x55 unlock sentinel) and the persisted
//! parameter-lock byte. Writes that touch flash are split in two so the
//! caller can answer on the bus first and commit afterwards: the check
//! returns [`WriteOutcome::RequiresPersist`] and the caller follows up
//! with [`MemoryStore::persist`].

use crate::nvm::{NvmError, NvmFlash, Page, PAGE_SIZE};
use crate::vars::{DeviceVariables, RomVariables};

/// Unlock sentinel for the bank lock byte.
pub const UNLOCK: u8 = 0x55;

/// Offsets within memory bank 0.
pub mod bank0 {
    /// Last implemented offset (holds 0x1A).
    pub const LAST_BYTE: u8 = 0x00;
    /// Last accessible bank number (holds 189).
    pub const LAST_BANK: u8 = 0x02;
    /// Six GTIN bytes, most significant first.
    pub const GTIN: u8 = 0x03;
    /// Firmware version, major then minor.
    pub const FW_VERSION: u8 = 0x09;
    /// Eight identification bytes, most significant first.
    pub const SERIAL: u8 = 0x0b;
    /// Hardware version, major then minor.
    pub const HW_VERSION: u8 = 0x13;
    /// IEC 62386-101 version number.
    pub const VERSION_101: u8 = 0x15;
    /// IEC 62386-102 version number (0xFF, not a control gear).
    pub const VERSION_102: u8 = 0x16;
    /// IEC 62386-103 version number.
    pub const VERSION_103: u8 = 0x17;
    /// Control devices integrated into the bus unit.
    pub const DEVICE_COUNT: u8 = 0x18;
    /// Control gear integrated into the bus unit.
    pub const GEAR_COUNT: u8 = 0x19;
    /// Index of this unit within the product.
    pub const INDEX: u8 = 0x1a;
}

/// Offsets within memory bank 189.
pub mod bank189 {
    /// Last implemented offset (holds 0x16).
    pub const LAST_BYTE: u8 = 0x00;
    /// Indicator byte.
    pub const INDICATOR: u8 = 0x01;
    /// Lock byte; RAM-backed, write 0x55 to unlock the bank.
    pub const LOCK: u8 = 0x02;
    /// Parameter lock; parameters accept writes only while this is 0.
    pub const PARAMETER_LOCK: u8 = 0x03;
    /// Writing 0 here restores the bank defaults.
    pub const FACTORY_RESET: u8 = 0x04;
    /// Calibration scale.
    pub const CAL_SCALE: u8 = 0x05;
    /// Calibration offset.
    pub const CAL_OFFSET: u8 = 0x06;
    /// PID proportional coefficient.
    pub const PID_P: u8 = 0x07;
    /// PID integral coefficient.
    pub const PID_I: u8 = 0x08;
    /// PID derivative coefficient.
    pub const PID_D: u8 = 0x09;
    /// Writing here triggers a dark calibration.
    pub const CALIBRATE_DARK: u8 = 0x0a;
    /// Writing here triggers a full-scale calibration.
    pub const CALIBRATE_FULL_SCALE: u8 = 0x0b;
    /// Full-scale range, low byte.
    pub const FULL_SCALE_LO: u8 = 0x15;
    /// Full-scale range, high byte.
    pub const FULL_SCALE_HI: u8 = 0x16;
}

const BANK0_LAST: u8 = 0x1a;
const BANK189_LAST: u8 = 0x16;
const FULL_SCALE_DEFAULT: u16 = 1000;
const CAL_SCALE_DEFAULT: u8 = 255;
const CAL_OFFSET_DEFAULT: u8 = 0;

/// Outcome of a memory-bank write check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOutcome {
    /// Bank missing, locked or offset out of range; nothing happened and
    /// no answer goes out.
    NotAllowed,
    /// The write took effect in RAM (or was absorbed); answer and move on.
    Ok,
    /// The write is legal but touches flash; answer first, then call
    /// [`MemoryStore::persist`].
    RequiresPersist,
}

/// The memory-bank store.
pub struct MemoryStore<N> {
    nvm: N,
    lock_byte: u8,
    dark_calibrate: bool,
    full_scale_calibrate: bool,
}

impl<N: NvmFlash> MemoryStore<N> {
    /// Wraps the flash collaborator. Banks come up locked.
    pub fn new(nvm: N) -> Self {
        MemoryStore {
            nvm,
            lock_byte: 0xff,
            dark_calibrate: false,
            full_scale_calibrate: false,
        }
    }

    /// Provisions both banks on first boot (blank bank 0).
    pub fn init(&mut self) -> Result<(), NvmError> {
        if self.byte(Page::Bank0, bank0::LAST_BYTE) == 0xff {
            self.provision_bank0()?;
            self.program_bank189_defaults()?;
        }
        Ok(())
    }

    /// Releases the flash collaborator.
    pub fn free(self) -> N {
        self.nvm
    }

    /// Reads one byte of a bank on behalf of READ_MEMORY_LOCATION.
    ///
    /// Fails for unimplemented banks, the indicator byte and offsets past
    /// the last implemented one. The lock byte reads from RAM and the
    /// factory-reset byte always reads 0xFF.
    pub fn read(&self, bank: u8, offset: u8) -> Option<u8> {
        let page = Self::bank_page(bank)?;
        if offset > self.byte(page, 0) || offset == bank189::INDICATOR {
            return None;
        }
        if bank != 0 && offset == bank189::LOCK {
            return Some(self.lock_byte);
        }
        if bank == 189 && offset == bank189::FACTORY_RESET {
            return Some(0xff);
        }
        Some(self.byte(page, offset))
    }

    /// Checks and applies the RAM-visible part of a write.
    pub fn write(&mut self, bank: u8, offset: u8, data: u8) -> WriteOutcome {
        let page = match Self::bank_page(bank) {
            Some(page) => page,
            None => return WriteOutcome::NotAllowed,
        };
        if bank != 0 && offset == bank189::LOCK {
            self.lock_byte = data;
            return WriteOutcome::Ok;
        }
        if bank != 189 {
            // Bank 0 is read-only at runtime.
            return WriteOutcome::NotAllowed;
        }
        match offset {
            bank189::FACTORY_RESET => {
                return if data == 0 {
                    WriteOutcome::RequiresPersist
                } else {
                    WriteOutcome::Ok
                };
            }
            bank189::CALIBRATE_DARK => {
                self.dark_calibrate = true;
                return WriteOutcome::Ok;
            }
            bank189::CALIBRATE_FULL_SCALE => {
                self.full_scale_calibrate = true;
                return WriteOutcome::Ok;
            }
            _ => {}
        }
        if self.lock_byte != UNLOCK
            || offset < bank189::PARAMETER_LOCK
            || offset > self.byte(page, 0)
        {
            return WriteOutcome::NotAllowed;
        }
        if offset != bank189::PARAMETER_LOCK && self.parameter_lock() != 0 {
            return WriteOutcome::NotAllowed;
        }
        WriteOutcome::RequiresPersist
    }

    /// Commits a write previously reported as [`WriteOutcome::RequiresPersist`],
    /// in a page copy, erase, program cycle. Writing 0 to the
    /// factory-reset byte restores the bank defaults instead.
    pub fn persist(&mut self, bank: u8, offset: u8, data: u8) -> Result<(), NvmError> {
        if bank == 189 && offset == bank189::FACTORY_RESET && data == 0 {
            return self.reset(189);
        }
        if offset as usize >= PAGE_SIZE {
            return Err(NvmError);
        }
        let page = Self::bank_page(bank).ok_or(NvmError)?;
        let mut buf = [0u8; PAGE_SIZE];
        self.nvm.read(page, 0, &mut buf);
        buf[offset as usize] = data;
        self.nvm.erase(page)?;
        self.nvm.program(page, 0, &buf)
    }

    /// Restores the bank 189 defaults. Bank 0 is retained. The bank must
    /// be unlocked; afterwards it is locked again.
    pub fn reset(&mut self, bank: u8) -> Result<(), NvmError> {
        if (bank != 0 && bank != 189) || self.lock_byte != UNLOCK {
            return Ok(());
        }
        self.program_bank189_defaults()?;
        self.lock_byte = 0xff;
        Ok(())
    }

    /// Calibration scale from bank 189.
    pub fn calibration_scale(&self) -> u8 {
        self.byte(Page::Bank189, bank189::CAL_SCALE)
    }

    /// Calibration offset from bank 189.
    pub fn calibration_offset(&self) -> u8 {
        self.byte(Page::Bank189, bank189::CAL_OFFSET)
    }

    /// Full-scale range from bank 189.
    pub fn full_scale_range(&self) -> u16 {
        let lo = self.byte(Page::Bank189, bank189::FULL_SCALE_LO) as u16;
        let hi = self.byte(Page::Bank189, bank189::FULL_SCALE_HI) as u16;
        (hi << 8) | lo
    }

    fn parameter_lock(&self) -> u8 {
        self.byte(Page::Bank189, bank189::PARAMETER_LOCK)
    }

    /// A dark calibration was requested over the bus.
    pub fn take_dark_calibrate(&mut self) -> bool {
        core::mem::replace(&mut self.dark_calibrate, false)
    }

    /// A full-scale calibration was requested over the bus.
    pub fn take_full_scale_calibrate(&mut self) -> bool {
        core::mem::replace(&mut self.full_scale_calibrate, false)
    }

    /// Demarshal the writable variables page; `None` on a blank page.
    pub fn load_variables(&self) -> Option<DeviceVariables> {
        let mut buf = [0u8; PAGE_SIZE];
        self.nvm.read(Page::Variables, 0, &mut buf);
        if buf.iter().all(|byte| *byte == 0xff) {
            return None;
        }
        ssmarshal::deserialize::<DeviceVariables>(&buf)
            .ok()
            .map(|(vars, _)| vars)
    }

    /// Rewrites the writable variables page.
    pub fn save_variables(&mut self, vars: &DeviceVariables) -> Result<(), NvmError> {
        let mut buf = [0u8; PAGE_SIZE];
        let len = ssmarshal::serialize(&mut buf, vars).map_err(|_| NvmError)?;
        self.nvm.erase(Page::Variables)?;
        self.nvm.program(Page::Variables, 0, &buf[..len])
    }

    /// Demarshal the factory page; `None` when never provisioned.
    pub fn load_rom(&self) -> Option<RomVariables> {
        let mut buf = [0u8; PAGE_SIZE];
        self.nvm.read(Page::Rom, 0, &mut buf);
        if buf.iter().all(|byte| *byte == 0xff) {
            return None;
        }
        ssmarshal::deserialize::<RomVariables>(&buf)
            .ok()
            .map(|(rom, _)| rom)
    }

    /// Writes the factory page, normally once at provisioning.
    pub fn save_rom(&mut self, rom: &RomVariables) -> Result<(), NvmError> {
        let mut buf = [0u8; PAGE_SIZE];
        let len = ssmarshal::serialize(&mut buf, rom).map_err(|_| NvmError)?;
        self.nvm.erase(Page::Rom)?;
        self.nvm.program(Page::Rom, 0, &buf[..len])
    }

    fn bank_page(bank: u8) -> Option<Page> {
        match bank {
            0 => Some(Page::Bank0),
            189 => Some(Page::Bank189),
            _ => None,
        }
    }

    fn byte(&self, page: Page, offset: u8) -> u8 {
        let mut buf = [0u8; 1];
        self.nvm.read(page, offset as usize, &mut buf);
        buf[0]
    }

    fn provision_bank0(&mut self) -> Result<(), NvmError> {
        let mut buf = [0xffu8; BANK0_LAST as usize + 1];
        buf[bank0::LAST_BYTE as usize] = BANK0_LAST;
        buf[bank0::LAST_BANK as usize] = 189;
        // GTIN 0x00 C8 3C 58 86 4A
        buf[bank0::GTIN as usize..bank0::GTIN as usize + 6]
            .copy_from_slice(&[0x00, 0xc8, 0x3c, 0x58, 0x86, 0x4a]);
        buf[bank0::FW_VERSION as usize] = 0;
        buf[bank0::FW_VERSION as usize + 1] = 1;
        for i in 0..8 {
            buf[bank0::SERIAL as usize + i] = 0;
        }
        buf[bank0::HW_VERSION as usize] = 0;
        buf[bank0::HW_VERSION as usize + 1] = 1;
        buf[bank0::VERSION_101 as usize] = 9;
        buf[bank0::VERSION_102 as usize] = 0xff;
        buf[bank0::VERSION_103 as usize] = 9;
        buf[bank0::DEVICE_COUNT as usize] = 1;
        buf[bank0::GEAR_COUNT as usize] = 0;
        buf[bank0::INDEX as usize] = 0;
        self.nvm.erase(Page::Bank0)?;
        self.nvm.program(Page::Bank0, 0, &buf)
    }

    fn program_bank189_defaults(&mut self) -> Result<(), NvmError> {
        let mut buf = [0xffu8; BANK189_LAST as usize + 1];
        buf[bank189::LAST_BYTE as usize] = BANK189_LAST;
        buf[bank189::CAL_SCALE as usize] = CAL_SCALE_DEFAULT;
        buf[bank189::CAL_OFFSET as usize] = CAL_OFFSET_DEFAULT;
        buf[bank189::FULL_SCALE_LO as usize] = (FULL_SCALE_DEFAULT & 0xff) as u8;
        buf[bank189::FULL_SCALE_HI as usize] = (FULL_SCALE_DEFAULT >> 8) as u8;
        self.nvm.erase(Page::Bank189)?;
        self.nvm.program(Page::Bank189, 0, &buf)
    }
}
