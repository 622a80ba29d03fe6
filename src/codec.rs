//! Manchester half-bit encoding and decoding
//!
//! The transmit side walks a frame as a schedule of 416.6 µs half-bits:
//! a start bit (low then high), the payload bits (low-high for 1,
//! high-low for 0) and at least two bit periods of released bus as stop
//! condition. The receive side never sees half-bits directly, only the
//! intervals between bus transitions, each spanning one or two TE.

use crate::frame::{FrameKind, RxError};
use crate::line::Level;
use crate::time::{RX_2TE_MAX, RX_2TE_MIN, RX_TE_MAX, RX_TE_MIN, TX_2TE_MAX, TX_2TE_MIN, TX_TE_MAX, TX_TE_MIN};

/// Interval classes accepted by either side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeClass {
    /// One half-bit elapsed.
    Te,
    /// Two half-bits elapsed.
    TwoTe,
}

/// Classifies an interval against the receive windows.
pub fn classify_rx(interval: u32) -> Option<EdgeClass> {
    if (RX_TE_MIN..=RX_TE_MAX).contains(&interval) {
        Some(EdgeClass::Te)
    } else if (RX_2TE_MIN..=RX_2TE_MAX).contains(&interval) {
        Some(EdgeClass::TwoTe)
    } else {
        None
    }
}

/// Classifies an echoed interval against the tighter transmit windows.
pub fn classify_tx(interval: u32) -> Option<EdgeClass> {
    if (TX_TE_MIN..=TX_TE_MAX).contains(&interval) {
        Some(EdgeClass::Te)
    } else if (TX_2TE_MIN..=TX_2TE_MAX).contains(&interval) {
        Some(EdgeClass::TwoTe)
    } else {
        None
    }
}

/// What the bit-timer handler does with the half-bit it just entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStep {
    /// Assert this level and reload the bit timer.
    Half(Level),
    /// Half-bit 56 reached, the frame is on the wire.
    Done,
}

/// Walks the half-bit schedule of one outgoing frame.
///
/// The cursor starts at half-bit 1 with the start bit's low half already
/// asserted by the caller. Half-bits 2..=49 carry payload; short frames
/// skip from the end of their payload straight to the stop phase at 50.
/// The payload is kept left-aligned with the next bit to transmit at
/// bit 23.
#[derive(Clone, Copy, Debug)]
pub struct TxShifter {
    packet: u32,
    half_bit: u8,
    skip_at: u8,
    prev_bit: bool,
    backframe: bool,
}

impl TxShifter {
    /// Prepares a frame for transmission.
    pub fn new(kind: FrameKind, frame: u32) -> Self {
        let packet = match kind {
            FrameKind::Backward8 => frame << 16,
            FrameKind::Forward16 => frame << 8,
            FrameKind::Forward24 => frame,
        };
        TxShifter {
            packet,
            half_bit: 1,
            skip_at: 2 + 2 * kind.bits(),
            prev_bit: false,
            backframe: kind == FrameKind::Backward8,
        }
    }

    /// Advances to the next half-bit and reports the level to assert.
    pub fn step(&mut self) -> TxStep {
        let step = match self.half_bit {
            // Second half of the start bit.
            1 => TxStep::Half(Level::High),
            // First half of the first payload bit. The start bit counts
            // as a transmitted 1 for collision checks.
            2 => {
                self.prev_bit = true;
                TxStep::Half(self.first_half_level())
            }
            50..=55 => TxStep::Half(Level::High),
            56 => TxStep::Done,
            n if n & 1 == 0 => {
                // First half of the next payload bit.
                self.prev_bit = self.packet & 0x0080_0000 != 0;
                self.packet <<= 1;
                TxStep::Half(self.first_half_level())
            }
            _ => {
                // Second half of the current payload bit.
                let one = self.packet & 0x0080_0000 != 0;
                TxStep::Half(if one { Level::High } else { Level::Low })
            }
        };
        if step != TxStep::Done {
            self.half_bit += 1;
            if self.half_bit == self.skip_at {
                self.half_bit = 50;
            }
        }
        step
    }

    fn first_half_level(&self) -> Level {
        if self.packet & 0x0080_0000 != 0 {
            Level::Low
        } else {
            Level::High
        }
    }

    /// Half-bit the schedule is currently in.
    pub fn half_bit(&self) -> u8 {
        self.half_bit
    }

    /// Last fully transmitted bit.
    pub fn prev_bit(&self) -> bool {
        self.prev_bit
    }

    /// Bit currently on the wire and the one after it.
    pub fn top_pair(&self) -> (bool, bool) {
        (
            self.packet & 0x0080_0000 != 0,
            self.packet & 0x0040_0000 != 0,
        )
    }

    /// Whether this schedule carries a backward frame.
    pub fn backframe(&self) -> bool {
        self.backframe
    }
}

/// Incremental receive-side bit assembly.
///
/// `phase` tracks the position within the current bit:
/// 0 awaiting the middle of the start bit, 1 after a rising edge at the
/// end of a bit, 2 after a falling edge at the end of a bit, 3 after a
/// rising edge at mid-bit, 4 after a falling edge at mid-bit. A bit is
/// recorded when its first half completes. The first reception error
/// sticks; later classification never downgrades it.
#[derive(Clone, Copy, Debug)]
pub struct RxAssembler {
    packet: u32,
    len: u8,
    phase: u8,
    error: RxError,
}

impl RxAssembler {
    /// Starts a fresh frame; the leading falling edge has just occurred.
    pub fn new() -> Self {
        RxAssembler {
            packet: 0,
            len: 0,
            phase: 0,
            error: RxError::None,
        }
    }

    /// Consumes one classified edge interval.
    pub fn edge(&mut self, class: Option<EdgeClass>) {
        match (self.phase, class) {
            (0, Some(EdgeClass::Te)) => self.phase = 3,
            (1, Some(EdgeClass::Te)) => {
                self.push(false);
                self.phase = 4;
            }
            (2, Some(EdgeClass::Te)) => {
                self.push(true);
                self.phase = 3;
            }
            (3, Some(EdgeClass::Te)) => self.phase = 2,
            (3, Some(EdgeClass::TwoTe)) => {
                self.push(false);
                self.phase = 4;
            }
            (4, Some(EdgeClass::Te)) => self.phase = 1,
            (4, Some(EdgeClass::TwoTe)) => {
                self.push(true);
                self.phase = 3;
            }
            _ => self.mark(RxError::BitTiming),
        }
    }

    fn push(&mut self, bit: bool) {
        self.packet = (self.packet << 1) | bit as u32;
        self.len += 1;
    }

    /// Records an error unless one is already pending.
    pub fn mark(&mut self, error: RxError) {
        if self.error == RxError::None {
            self.error = error;
        }
    }

    /// Assembled payload so far.
    pub fn packet(&self) -> u32 {
        self.packet
    }

    /// Number of bits assembled.
    pub fn len(&self) -> u8 {
        self.len
    }

    /// Sticky reception error.
    pub fn error(&self) -> RxError {
        self.error
    }

    /// Whether the most recent bit was a 1. Needed at the stop condition:
    /// a trailing 1 leaves the decoder one TE short of the frame end.
    pub fn last_bit_one(&self) -> bool {
        self.packet & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TE;

    // Serialises a frame on an ideal line and feeds the resulting edge
    // intervals back through the assembler.
    fn roundtrip(kind: FrameKind, payload: u32) -> RxAssembler {
        let mut tx = TxShifter::new(kind, payload);
        let mut level = Level::Low;
        let mut now = 0u32;
        let mut last_edge = 0u32;
        let mut rx = RxAssembler::new();
        loop {
            now += TE;
            match tx.step() {
                TxStep::Half(l) => {
                    if l != level {
                        rx.edge(classify_rx(now - last_edge));
                        last_edge = now;
                        level = l;
                    }
                }
                TxStep::Done => break,
            }
        }
        rx
    }

    #[test]
    fn roundtrip_forward24_sweep() {
        // Striding keeps the sweep fast while still crossing every byte
        // boundary pattern; the edges of the space are covered exactly.
        let mut payload = 0u32;
        while payload < 1 << 24 {
            let rx = roundtrip(FrameKind::Forward24, payload);
            assert_eq!(rx.error(), RxError::None, "payload {:#08x}", payload);
            assert_eq!(rx.len(), 24);
            assert_eq!(rx.packet(), payload);
            payload += 997;
        }
        for payload in [0, 1, 0x555_555, 0xaaa_aaa, 0xfff_ffe, 0xff_ffff] {
            let rx = roundtrip(FrameKind::Forward24, payload);
            assert_eq!(rx.packet(), payload);
            assert_eq!(rx.len(), 24);
            assert_eq!(rx.error(), RxError::None);
        }
    }

    #[test]
    fn roundtrip_backward8() {
        for payload in 0..=0xffu32 {
            let rx = roundtrip(FrameKind::Backward8, payload);
            assert_eq!(rx.error(), RxError::None);
            assert_eq!(rx.len(), 8);
            assert_eq!(rx.packet(), payload);
        }
    }

    #[test]
    fn roundtrip_forward16() {
        for payload in (0..=0xffffu32).step_by(97) {
            let rx = roundtrip(FrameKind::Forward16, payload);
            assert_eq!(rx.error(), RxError::None);
            assert_eq!(rx.len(), 16);
            assert_eq!(rx.packet(), payload);
        }
    }

    #[test]
    fn rx_window_edges() {
        use crate::time::{RX_2TE_MAX, RX_2TE_MIN, RX_TE_MAX, RX_TE_MIN};
        assert_eq!(classify_rx(RX_TE_MIN), Some(EdgeClass::Te));
        assert_eq!(classify_rx(RX_TE_MAX), Some(EdgeClass::Te));
        assert_eq!(classify_rx(RX_TE_MIN - 1), None);
        assert_eq!(classify_rx(RX_TE_MAX + 1), None);
        assert_eq!(classify_rx(RX_2TE_MIN), Some(EdgeClass::TwoTe));
        assert_eq!(classify_rx(RX_2TE_MAX), Some(EdgeClass::TwoTe));
        assert_eq!(classify_rx(RX_2TE_MAX + 1), None);
    }

    #[test]
    fn first_error_sticks() {
        let mut rx = RxAssembler::new();
        rx.edge(classify_rx(TE));
        rx.edge(classify_rx(100));
        assert_eq!(rx.error(), RxError::BitTiming);
        rx.mark(RxError::FrameSize);
        assert_eq!(rx.error(), RxError::BitTiming);
    }

    #[test]
    fn backframe_skips_to_stop() {
        let mut tx = TxShifter::new(FrameKind::Backward8, 0xff);
        // Start-bit half plus 16 payload halves.
        for _ in 0..17 {
            assert!(tx.step() != TxStep::Done);
        }
        assert_eq!(tx.half_bit(), 50);
    }
}
