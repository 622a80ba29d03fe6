//! Stack configuration

/// Role of this device on the bus.
///
/// The role decides the length of outgoing forward frames: application
/// controllers talk to control gear in 16-bit frames, input devices emit
/// 24-bit frames. Reception is unaffected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceMode {
    /// Active application controller, 16-bit forward frames.
    ApplicationController,
    /// Input device, 24-bit forward frames.
    InputDevice,
}

impl Default for DeviceMode {
    fn default() -> Self {
        DeviceMode::InputDevice
    }
}

/// Capacity of the transmit queue.
pub const TX_QUEUE_DEPTH: usize = 32;

/// Capacity of the receive queue (one slot is reserved by the ring).
pub const RX_QUEUE_DEPTH: usize = 32;
