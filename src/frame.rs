//! Frame and queue entry types

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Transmission priority. Priority 1 is the highest and is reserved for
/// backward frames; forward frames use 2..=5.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive,
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    /// Backward frames and other immediate replies.
    P1 = 1,
    /// Highest forward-frame priority.
    P2 = 2,
    /// Default priority of most commands.
    P3 = 3,
    /// Default priority of event messages.
    P4 = 4,
    /// Lowest priority.
    P5 = 5,
}

/// Direction of a transmit request. The bit length of a forward frame
/// follows the configured [`DeviceMode`](crate::config::DeviceMode).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxKind {
    /// Forward frame (16 or 24 bits).
    Forward,
    /// 8-bit backward frame.
    Backward,
}

/// Validated frame classes seen on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// 16-bit forward frame (application controller to control gear).
    Forward16,
    /// 24-bit forward frame (control device traffic).
    Forward24,
    /// 8-bit backward frame.
    Backward8,
}

impl FrameKind {
    /// Number of payload bits.
    pub fn bits(self) -> u8 {
        match self {
            FrameKind::Forward16 => 16,
            FrameKind::Forward24 => 24,
            FrameKind::Backward8 => 8,
        }
    }
}

/// Reception error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxError {
    /// Frame received cleanly.
    None,
    /// An edge interval fell outside both receive windows, or the bus was
    /// still down at the end of the stop condition.
    BitTiming,
    /// A frame arrived in a slot it does not belong in: a backward frame
    /// outside the reply window, a forward frame inside it, or a missing
    /// second copy of a send-twice command.
    FrameTiming,
    /// The frame ended with a bit count other than 8 or 24.
    FrameSize,
}

/// One entry of the transmit queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxRequest {
    /// Right-aligned payload.
    pub frame: u32,
    /// Forward or backward frame.
    pub kind: TxKind,
    /// Transmit the frame twice, the second copy after the reply window
    /// of the first has elapsed.
    pub send_twice: bool,
    /// Arbitration priority.
    pub priority: Priority,
}

impl TxRequest {
    /// A forward frame.
    pub fn forward(frame: u32, priority: Priority) -> Self {
        TxRequest {
            frame,
            kind: TxKind::Forward,
            send_twice: false,
            priority,
        }
    }

    /// A backward frame carrying one answer byte, priority 1.
    pub fn backframe(answer: u8) -> Self {
        TxRequest {
            frame: answer as u32,
            kind: TxKind::Backward,
            send_twice: false,
            priority: Priority::P1,
        }
    }
}

/// One entry of the receive queue.
///
/// Records with `error` other than [`RxError::None`] are still delivered
/// so the application can count failures; their `frame`, `length` and
/// `kind` describe whatever was assembled before the error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxRecord {
    /// Right-aligned payload.
    pub frame: u32,
    /// Number of bits received.
    pub length: u8,
    /// Frame class, derived from the length.
    pub kind: FrameKind,
    /// Reception ran to the stop condition.
    pub done: bool,
    /// Reception error, if any.
    pub error: RxError,
    /// The frame started inside a window in which the second copy of a
    /// send-twice command may arrive.
    pub send_twice_possible: bool,
}

/// Outcome of the most recent transmission, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxFlags {
    /// The frame (including any second copy) went out.
    pub done: bool,
    /// The transmission was aborted by a collision; the frame is retried
    /// automatically.
    pub error: bool,
}

/// The transmit queue is full; the request was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Busy;
