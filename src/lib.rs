//! Driver stack for DALI-2 (IEC 62386-101/103) control devices
//!
//! This crate implements the physical/link layer and the part 103
//! application layer of a DALI-2 input device or application controller
//! on a bit-banged bus. The entry points are the [`DaliLink`] struct for
//! the bare link layer and the [`DaliDevice`] struct for the complete
//! control device.
//!
//! The hardware stays behind four small traits so the stack runs on any
//! platform (and on the host, against a simulated bus):
//!
//! - [`Line`] drives and samples the bus transceiver, with an
//!   [`OpenDrainLine`] adapter over `embedded-hal` pins,
//! - [`BitTimer`] and [`EdgeTimer`] are two channels of an 8 MHz timer,
//! - [`NvmFlash`] provides the four flash pages behind the memory banks
//!   and the persistent variables.
//!
//! Wire the platform interrupts to [`DaliDevice::on_bit_tick`] (bit-timer
//! expiry), [`DaliDevice::on_edge`] (any RX transition) and
//! [`DaliDevice::tick_1ms`] (housekeeping), then service
//! [`DaliDevice::poll`] from the main loop. The handlers are bounded and
//! never block; the link retries collisions on its own and delivers
//! malformed receptions with their error attached.

#![cfg_attr(not(test), no_std)]

pub mod app;
pub mod config;
pub mod frame;
pub mod line;
pub mod link;
pub mod memory;
pub mod nvm;
pub mod time;
pub mod timer;
pub mod vars;

mod codec;
mod monitor;
mod util;

pub use crate::app::{DaliDevice, InitialisationState};
pub use crate::config::DeviceMode;
pub use crate::frame::{Busy, FrameKind, Priority, RxError, RxRecord, TxFlags, TxKind, TxRequest};
pub use crate::line::{Level, Line, OpenDrainLine};
pub use crate::link::{DaliLink, LinkState};
pub use crate::memory::{MemoryStore, WriteOutcome};
pub use crate::nvm::{NvmError, NvmFlash, Page, PAGE_SIZE};
pub use crate::timer::{BitTimer, EdgeTimer};
pub use crate::vars::{DeviceVariables, RomVariables};
