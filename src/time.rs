//! Bus timing constants
//!
//! All values are in ticks of the 8 MHz timer service, 125 ns each. They
//! derive from the nominal half-bit period of 416.6 µs and the timing
//! tolerances of IEC 62386-101.

/// One half-bit period (416.6 µs).
pub const TE: u32 = 3333;

// Transmit-side windows, used for collision detection while the device is
// driving the bus. The echoed transition must land inside one of these.

/// Earliest acceptable echo of a single-TE transition (356.7 µs).
pub const TX_TE_MIN: u32 = 2854;
/// Latest acceptable echo of a single-TE transition (476.7 µs).
pub const TX_TE_MAX: u32 = 3814;
/// Earliest acceptable echo of a double-TE transition (723.3 µs).
pub const TX_2TE_MIN: u32 = 5787;
/// Latest acceptable echo of a double-TE transition (943.3 µs).
pub const TX_2TE_MAX: u32 = 7546;

/// How long the bus is held down after a detected collision (1.3 ms).
pub const BREAK_HOLD: u32 = 10_400;
/// Nominal recovery wait after a break (4.3 ms).
pub const RECOVERY: u32 = 34_400;
/// The recovery wait is randomised by up to this much in either direction.
pub const RECOVERY_JITTER: u32 = 1_400;

// Settling time between a received forward frame and our backward frame.
// The wait is randomised inside the window; all settling values are
// quoted minus the six half-bits of stop condition already elapsed.

/// Earliest start of a backward frame (5.5 ms minus 6 TE).
pub const BF_SETTLE_MIN: u32 = 24_000;
/// Nominal backward-frame settling time.
pub const BF_SETTLE_NOM: u32 = 40_000;
/// Latest start of a backward frame (10.5 ms minus 6 TE).
pub const BF_SETTLE_MAX: u32 = 64_000;

/// Settling time before a forward frame of priority 1..=5 may launch.
///
/// Segment `n` of the pre-idle ladder corresponds to priority `n + 1`.
/// The lower bounds of the five windows are 88 000, 99 200, 110 400,
/// 123 200 and 136 000 ticks.
pub const FF_SETTLE: [u32; 5] = [92_200, 102_300, 117_000, 128_200, 141_000];

// Receive-side windows. An edge interval inside the single-TE window
// advances the decoder by one half-bit, the double-TE window by two,
// anything else is a bit-timing error. The single-TE window is widened
// low to compensate for the asymmetry of the input filter.

/// Earliest accepted single-TE interval (333.25 µs, pre-compensated).
pub const RX_TE_MIN: u32 = 2366;
/// Latest accepted single-TE interval (500 µs plus grey area).
pub const RX_TE_MAX: u32 = 4300;
/// Earliest accepted double-TE interval.
pub const RX_2TE_MIN: u32 = 5132;
/// Latest accepted double-TE interval.
pub const RX_2TE_MAX: u32 = 8200;

/// Quiet time after which a frame is considered finished (2.4 ms).
pub const RX_STOP_MIN: u32 = 19_200;

/// How long a transmitted forward frame waits for a backward frame
/// (13.4 ms minus 6 TE).
pub const RX_BF_MAX: u32 = 87_200;

/// Window within which the second copy of a send-twice forward frame must
/// arrive (100 ms).
pub const SEND_TWICE_WINDOW: u32 = 800_000;
