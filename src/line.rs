//! Access to the physical bus line
//!
//! The state machine talks to the transceiver stage through the [`Line`]
//! trait, which deals in logical bus levels only. An adapter over
//! `embedded-hal` pins is provided for the common inverting open-collector
//! transmitter stage.

use embedded_hal::digital::v2::{InputPin, OutputPin};

/// Logical level of the DALI bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Dominant state, bus pulled down.
    Low,
    /// Recessive state, bus idle.
    High,
}

/// One bus transceiver.
///
/// Both operations must be free of side effects beyond the pins and safe
/// to call from interrupt context. Driving [`Level::High`] releases the
/// bus; the line then floats high unless another device pulls it down,
/// which is why [`Line::sense`] can disagree with the last driven level.
pub trait Line {
    /// Drive the transmitter stage. Must be idempotent.
    fn drive(&mut self, level: Level);

    /// Sample the receiver comparator.
    fn sense(&self) -> Level;
}

/// [`Line`] adapter for an inverting open-collector transmitter stage and
/// an inverting receiver comparator: a high TX pin pulls the bus down, a
/// high RX pin means the bus is down.
///
/// Pin errors are discarded; use infallible pins.
pub struct OpenDrainLine<TX, RX> {
    tx: TX,
    rx: RX,
}

impl<TX, RX> OpenDrainLine<TX, RX>
where
    TX: OutputPin,
    RX: InputPin,
{
    /// Wraps the two pins. The bus is released immediately.
    pub fn new(tx: TX, rx: RX) -> Self {
        let mut line = OpenDrainLine { tx, rx };
        line.drive(Level::High);
        line
    }

    /// Releases the pins.
    pub fn free(self) -> (TX, RX) {
        (self.tx, self.rx)
    }
}

impl<TX, RX> Line for OpenDrainLine<TX, RX>
where
    TX: OutputPin,
    RX: InputPin,
{
    fn drive(&mut self, level: Level) {
        let _ = match level {
            Level::Low => self.tx.set_high(),
            Level::High => self.tx.set_low(),
        };
    }

    fn sense(&self) -> Level {
        match self.rx.is_high() {
            Ok(true) => Level::Low,
            _ => Level::High,
        }
    }
}
