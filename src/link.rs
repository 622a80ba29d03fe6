//! Link state machine
//!
//! The entry point to the wire protocol is the [`DaliLink`] struct. It
//! owns the bus [`Line`], the two timer channels and the frame queues,
//! and is driven entirely by three entry points: [`DaliLink::on_bit_tick`]
//! from the bit-timer expiry interrupt, [`DaliLink::on_edge`] from the RX
//! edge interrupt and [`DaliLink::tick_1khz`] from the housekeeping tick.
//! The application side enqueues [`TxRequest`]s with [`DaliLink::send`]
//! and drains [`RxRecord`]s with [`DaliLink::receive`].
//!
//! One instance serialises all access: wrap it in whatever mutual
//! exclusion the platform uses to share state between interrupt handlers
//! and the main loop (a critical-section mutex on single-core parts).
//!
//! Transmissions are collision-checked against the echoed line state.
//! A frame lost to a collision is put back ahead of the queue and retried
//! once its priority slot comes around again; the application is not
//! involved. Malformed receptions are delivered with their error attached
//! rather than dropped.

use core::convert::Infallible;
use core::mem;

use heapless::binary_heap::{BinaryHeap, Min};
use heapless::spsc::Queue;

use crate::codec::{classify_rx, classify_tx, EdgeClass, RxAssembler, TxShifter, TxStep};
use crate::config::{DeviceMode, RX_QUEUE_DEPTH, TX_QUEUE_DEPTH};
use crate::frame::{Busy, FrameKind, RxError, RxRecord, TxFlags, TxKind, TxRequest};
use crate::line::{Level, Line};
use crate::monitor::CableMonitor;
use crate::time::{
    BF_SETTLE_MAX, BF_SETTLE_MIN, BF_SETTLE_NOM, BREAK_HOLD, FF_SETTLE, RECOVERY,
    RECOVERY_JITTER, RX_BF_MAX, RX_STOP_MIN, SEND_TWICE_WINDOW, TE, TX_TE_MAX, TX_TE_MIN,
};
use crate::timer::{BitTimer, EdgeTimer};
use crate::util::Xorshift32;

/// Observable state of the link state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// Bus idle, both directions possible.
    Idle,
    /// Driving a frame onto the bus.
    SendData,
    /// Assembling an incoming frame.
    ReceiveData,
    /// One extra TE of silence to tell a trailing 1 from the stop phase.
    ReceiveDataExtraTe,
    /// Holding the 100 ms window for the second copy of a send-twice
    /// command.
    WaitForSecondForwardFrame,
    /// Our forward frame went out; the reply slot is open.
    WaitForBackFrame,
    /// A forward frame arrived; settling before a possible reply.
    WaitToSendBackFrame,
    /// Holding the bus down after a collision.
    Break,
    /// Walking the priority ladder of inter-frame settling times.
    PreIdle,
}

struct Receive {
    asm: RxAssembler,
    from: LinkState,
    twice_possible: bool,
}

enum State {
    Idle,
    SendData(TxShifter),
    ReceiveData(Receive),
    ReceiveDataExtraTe(Receive),
    WaitForSecondForwardFrame,
    WaitForBackFrame,
    WaitToSendBackFrame { settle: u32 },
    Break,
    PreIdle { reached: u8 },
}

impl State {
    fn observable(&self) -> LinkState {
        match self {
            State::Idle => LinkState::Idle,
            State::SendData(_) => LinkState::SendData,
            State::ReceiveData(_) => LinkState::ReceiveData,
            State::ReceiveDataExtraTe(_) => LinkState::ReceiveDataExtraTe,
            State::WaitForSecondForwardFrame => LinkState::WaitForSecondForwardFrame,
            State::WaitForBackFrame => LinkState::WaitForBackFrame,
            State::WaitToSendBackFrame { .. } => LinkState::WaitToSendBackFrame,
            State::Break => LinkState::Break,
            State::PreIdle { .. } => LinkState::PreIdle,
        }
    }
}

// Transmit queue entry. The heap orders by priority first and admission
// order second, so arbitration is priority-exact while staying FIFO
// inside one priority class.
struct TxEntry {
    seq: u16,
    req: TxRequest,
}

impl TxEntry {
    fn key(&self) -> (u8, u16) {
        (self.req.priority.into(), self.seq)
    }
}

impl PartialEq for TxEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TxEntry {}

impl PartialOrd for TxEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TxEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// The DALI link layer.
pub struct DaliLink<L, BT, ET> {
    line: L,
    bit_timer: BT,
    edge_timer: ET,
    state: State,
    mode: DeviceMode,
    tx_queue: BinaryHeap<TxEntry, Min, TX_QUEUE_DEPTH>,
    tx_seq: u16,
    rx_queue: Queue<RxRecord, RX_QUEUE_DEPTH>,
    in_flight: Option<TxRequest>,
    send_twice_pending: bool,
    receive_twice: bool,
    tx_flags: TxFlags,
    overlap: u32,
    monitor: CableMonitor,
    rng: Xorshift32,
}

impl<L, BT, ET> DaliLink<L, BT, ET>
where
    L: Line,
    BT: BitTimer,
    ET: EdgeTimer,
{
    /// Creates the link layer around its hardware. `seed` feeds the
    /// back-off randomisation and should come from a free-running timer.
    pub fn new(line: L, bit_timer: BT, edge_timer: ET, mode: DeviceMode, seed: u32) -> Self {
        let mut link = DaliLink {
            line,
            bit_timer,
            edge_timer,
            state: State::Idle,
            mode,
            tx_queue: BinaryHeap::new(),
            tx_seq: 0,
            rx_queue: Queue::new(),
            in_flight: None,
            send_twice_pending: false,
            receive_twice: false,
            tx_flags: TxFlags::default(),
            overlap: 0,
            monitor: CableMonitor::new(),
            rng: Xorshift32::new(seed),
        };
        link.line.drive(Level::High);
        link.bit_timer.disarm();
        link
    }

    /// Changes the forward-frame length for subsequent transmissions.
    pub fn set_mode(&mut self, mode: DeviceMode) {
        self.mode = mode;
    }

    /// Current role.
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// State for diagnostics.
    pub fn read_state(&self) -> LinkState {
        self.state.observable()
    }

    /// Outcome of the most recent transmission.
    pub fn read_flags(&self) -> TxFlags {
        self.tx_flags
    }

    /// Whether the cable monitor currently sees a powered bus.
    pub fn cable_connected(&self) -> bool {
        self.monitor.connected()
    }

    /// Whether a receive record is waiting.
    pub fn data_available(&self) -> bool {
        self.rx_queue.peek().is_some()
    }

    /// Takes the oldest receive record.
    pub fn receive(&mut self) -> nb::Result<RxRecord, Infallible> {
        self.rx_queue.dequeue().ok_or(nb::Error::WouldBlock)
    }

    /// Queues a frame for transmission. If the bus is idle the frame
    /// starts immediately; otherwise it launches once its priority slot
    /// of the inter-frame settling ladder is reached.
    pub fn send(&mut self, req: TxRequest) -> Result<(), Busy> {
        let entry = TxEntry {
            seq: self.tx_seq,
            req,
        };
        self.tx_seq = self.tx_seq.wrapping_add(1);
        let result = self.tx_queue.push(entry).map(|_| ()).map_err(|_| Busy);
        if let State::Idle = self.state {
            if let Some(next) = self.take_pending() {
                self.launch(next);
            }
        }
        result
    }

    /// Tells the link that the frame just handed to the application must
    /// be received a second time. Instead of returning to idle after the
    /// reply settling time, the machine holds the 100 ms window open.
    pub fn expect_send_twice(&mut self) {
        self.receive_twice = true;
    }

    /// 1 kHz housekeeping: cable monitoring.
    pub fn tick_1khz(&mut self) {
        let level = self.line.sense();
        self.monitor.sample(level);
    }

    /// Bit-timer expiry interrupt.
    pub fn on_bit_tick(&mut self) {
        let state = mem::replace(&mut self.state, State::Idle);
        match state {
            State::Idle => self.bit_timer.disarm(),
            State::SendData(tx) => self.send_data_tick(tx),
            State::ReceiveData(rx) => self.receive_stop(rx, false),
            State::ReceiveDataExtraTe(rx) => self.receive_stop(rx, true),
            State::WaitForBackFrame => {
                // The reply slot closed. A pending second transmission of
                // a send-twice frame starts right away.
                if self.send_twice_pending {
                    self.restart_in_flight();
                } else {
                    self.bit_timer.arm(FF_SETTLE[0] - RX_BF_MAX);
                    self.state = State::PreIdle { reached: 1 };
                }
            }
            State::WaitToSendBackFrame { settle } => self.backframe_slot_tick(settle),
            State::WaitForSecondForwardFrame => {
                // No second copy arrived in time. Deliver an empty record
                // so the application sees the failed transaction.
                self.push_rx(RxRecord {
                    frame: 0,
                    length: 0,
                    kind: FrameKind::Forward24,
                    done: true,
                    error: RxError::FrameTiming,
                    send_twice_possible: false,
                });
                self.bit_timer.arm(SEND_TWICE_WINDOW - BF_SETTLE_NOM);
                self.state = State::PreIdle { reached: 1 };
            }
            State::Break => {
                self.line.drive(Level::High);
                if self.line.sense() == Level::Low {
                    // Someone else is still holding the bus down.
                    self.bit_timer.arm(FF_SETTLE[0]);
                } else {
                    let jitter = self.rng.below(2 * RECOVERY_JITTER + 1);
                    self.bit_timer.arm(RECOVERY - RECOVERY_JITTER + jitter);
                }
                self.state = State::PreIdle { reached: 1 };
            }
            State::PreIdle { reached } => self.pre_idle_tick(reached),
        }
    }

    /// RX edge interrupt. The edge timer holds the time since the
    /// previous edge and must be read before this returns.
    pub fn on_edge(&mut self) {
        let state = mem::replace(&mut self.state, State::Idle);
        match state {
            State::Idle | State::PreIdle { .. } => {
                self.line.drive(Level::High);
                if self.line.sense() == Level::High {
                    // Rising edge of a freshly connected cable.
                    self.state = state;
                } else {
                    let from = state.observable();
                    self.start_receive(from, false);
                }
            }
            State::SendData(tx) => self.send_data_edge(tx),
            State::WaitForBackFrame => {
                // Either the reply, or a forward frame sent too early.
                // Which one it was is decided by the length at the end.
                self.start_receive(LinkState::WaitForBackFrame, false);
            }
            State::WaitToSendBackFrame { .. } => {
                self.start_receive(LinkState::WaitToSendBackFrame, true);
            }
            State::WaitForSecondForwardFrame => {
                self.start_receive(LinkState::WaitForSecondForwardFrame, true);
            }
            State::ReceiveData(mut rx) => {
                let interval = self.edge_timer.now();
                self.edge_timer.reset();
                self.bit_timer.reset();
                self.bit_timer.arm(RX_STOP_MIN);
                rx.asm.edge(classify_rx(interval));
                self.state = State::ReceiveData(rx);
            }
            State::ReceiveDataExtraTe(mut rx) => {
                // Nothing may move during the last stop half-bit.
                rx.asm.mark(RxError::BitTiming);
                self.state = State::ReceiveDataExtraTe(rx);
            }
            State::Break => self.state = State::Break,
        }
    }

    // Highest-priority pending request: a collision retry first, then the
    // top of the queue.
    fn take_pending(&mut self) -> Option<TxRequest> {
        if let Some(req) = self.in_flight.take() {
            return Some(req);
        }
        self.tx_queue.pop().map(|entry| entry.req)
    }

    fn pending_priority(&self) -> Option<u8> {
        if let Some(req) = self.in_flight.as_ref() {
            return Some(req.priority.into());
        }
        self.tx_queue.peek().map(|entry| entry.req.priority.into())
    }

    fn pending_is_backframe(&self) -> bool {
        if let Some(req) = self.in_flight.as_ref() {
            return req.kind == TxKind::Backward;
        }
        self.tx_queue
            .peek()
            .map(|entry| entry.req.kind == TxKind::Backward)
            .unwrap_or(false)
    }

    fn resolve_kind(&self, kind: TxKind) -> FrameKind {
        match kind {
            TxKind::Backward => FrameKind::Backward8,
            TxKind::Forward => match self.mode {
                DeviceMode::ApplicationController => FrameKind::Forward16,
                DeviceMode::InputDevice => FrameKind::Forward24,
            },
        }
    }

    // Puts a frame on the wire: start-bit low half now, first tick in TE.
    // The request stays in `in_flight` until the stop phase completes so
    // a collision can re-queue it ahead of everything else.
    fn launch(&mut self, req: TxRequest) {
        self.tx_flags = TxFlags::default();
        self.send_twice_pending = req.send_twice;
        self.overlap = 0;
        let shifter = TxShifter::new(self.resolve_kind(req.kind), req.frame);
        self.in_flight = Some(req);
        self.bit_timer.reset();
        self.bit_timer.arm(TE);
        self.line.drive(Level::Low);
        self.state = State::SendData(shifter);
    }

    // Second transmission of a send-twice frame.
    fn restart_in_flight(&mut self) {
        self.send_twice_pending = false;
        match self.in_flight {
            Some(req) => {
                let shifter = TxShifter::new(self.resolve_kind(req.kind), req.frame);
                self.bit_timer.reset();
                self.bit_timer.arm(TE);
                self.line.drive(Level::Low);
                self.state = State::SendData(shifter);
            }
            None => {
                self.bit_timer.arm(FF_SETTLE[0] - RX_BF_MAX);
                self.state = State::PreIdle { reached: 1 };
            }
        }
    }

    fn send_data_tick(&mut self, mut tx: TxShifter) {
        let reload = TE - self.overlap;
        self.overlap = 0;
        let half_bit = tx.half_bit();
        match tx.step() {
            TxStep::Half(level) => {
                // The start bit is never phase-corrected.
                self.bit_timer.arm(if half_bit == 1 { TE } else { reload });
                self.line.drive(level);
                self.state = State::SendData(tx);
            }
            TxStep::Done => {
                if tx.backframe() {
                    self.bit_timer.arm(FF_SETTLE[0]);
                    self.state = State::PreIdle { reached: 1 };
                } else {
                    self.bit_timer.arm(RX_BF_MAX);
                    self.state = State::WaitForBackFrame;
                }
                if !self.send_twice_pending {
                    self.tx_flags = TxFlags {
                        done: true,
                        error: false,
                    };
                    self.in_flight = None;
                }
            }
        }
    }

    // Collision detection. While we drive the bus every transition must
    // echo back inside the transmit windows and match the polarity the
    // schedule predicts. The double-TE path additionally re-phases the
    // bit timer against line capacitance: falling edges arrive early,
    // rising edges late.
    fn send_data_edge(&mut self, tx: TxShifter) {
        if tx.half_bit() == 1 {
            // Leading edge of our own start bit.
            self.edge_timer.reset();
            self.state = State::SendData(tx);
            return;
        }
        let interval = self.edge_timer.now();
        self.edge_timer.reset();
        let sensed = self.line.sense();
        let half_bit = tx.half_bit();
        let (current, next) = tx.top_pair();
        let prev = tx.prev_bit();
        match classify_tx(interval) {
            Some(EdgeClass::Te) => {
                // A falling edge where the schedule keeps the bus high is
                // another transmitter. At the frame start that shows up
                // against the first payload bit, later against the
                // 1-to-0 transitions of the schedule.
                let at_first_bit = half_bit == 2 && !current;
                let at_one_zero = (half_bit % 2 == 0 && current && !next)
                    || (half_bit % 2 == 1 && prev && !current);
                if (at_first_bit || at_one_zero) && sensed == Level::Low {
                    self.abort_collision();
                } else {
                    self.state = State::SendData(tx);
                }
            }
            Some(EdgeClass::TwoTe) => {
                if sensed == Level::Low && prev {
                    if half_bit % 2 == 1 && interval < TE + TX_TE_MIN {
                        // Early falling edge: shorten the next reload.
                        self.overlap = 2 * TE - interval;
                    }
                    self.state = State::SendData(tx);
                } else if sensed == Level::High && !prev {
                    if half_bit % 2 == 0 && interval > TE + TX_TE_MAX {
                        // Late rising edge: push the pending tick out.
                        let count = self.bit_timer.now();
                        let excess = interval - 2 * TE;
                        self.bit_timer.set_count(count.saturating_sub(excess));
                    }
                    self.state = State::SendData(tx);
                } else {
                    self.abort_collision();
                }
            }
            None => self.abort_collision(),
        }
    }

    fn abort_collision(&mut self) {
        self.tx_flags = TxFlags {
            done: false,
            error: true,
        };
        self.bit_timer.reset();
        self.bit_timer.arm(BREAK_HOLD);
        self.line.drive(Level::Low);
        // `in_flight` keeps the aborted request; it is retried before
        // anything enqueued later.
        self.state = State::Break;
    }

    fn pre_idle_tick(&mut self, reached: u8) {
        if let Some(priority) = self.pending_priority() {
            if priority <= reached {
                if let Some(req) = self.take_pending() {
                    self.launch(req);
                    return;
                }
            }
        }
        if reached >= 5 {
            self.bit_timer.disarm();
            self.state = State::Idle;
        } else {
            let segment = reached as usize;
            self.bit_timer.arm(FF_SETTLE[segment] - FF_SETTLE[segment - 1]);
            self.state = State::PreIdle {
                reached: reached + 1,
            };
        }
    }

    // The settling time after a received forward frame ran out. Send a
    // scheduled reply, or hold the send-twice window if the application
    // asked for it, or fall back to the priority ladder.
    fn backframe_slot_tick(&mut self, settle: u32) {
        if self.receive_twice {
            self.receive_twice = false;
            self.bit_timer.arm(SEND_TWICE_WINDOW - settle);
            self.state = State::WaitForSecondForwardFrame;
        } else if self.pending_is_backframe() {
            if let Some(req) = self.take_pending() {
                self.launch(req);
            }
        } else {
            self.bit_timer.arm(FF_SETTLE[0] - settle);
            self.state = State::PreIdle { reached: 1 };
        }
    }

    fn start_receive(&mut self, from: LinkState, twice_possible: bool) {
        self.edge_timer.reset();
        self.bit_timer.reset();
        self.bit_timer.arm(RX_STOP_MIN);
        self.state = State::ReceiveData(Receive {
            asm: RxAssembler::new(),
            from,
            twice_possible,
        });
    }

    // Stop floor elapsed without an edge. A trailing 1 leaves the line
    // released one TE before the frame boundary, so wait that TE out
    // before classifying; otherwise classify right away.
    fn receive_stop(&mut self, rx: Receive, after_extra_te: bool) {
        let len = rx.asm.len();
        if !after_extra_te && (len == 8 || len == 24) && rx.asm.last_bit_one() {
            self.bit_timer.arm(TE);
            self.state = State::ReceiveDataExtraTe(rx);
            return;
        }
        self.classify(rx);
    }

    fn classify(&mut self, mut rx: Receive) {
        // The bus must have returned high by the last stop tick.
        if self.line.sense() == Level::Low {
            rx.asm.mark(RxError::BitTiming);
        }
        let len = rx.asm.len();
        match len {
            8 => {
                // A backward frame is only legal in the reply slot of a
                // forward frame we sent.
                if rx.from != LinkState::WaitForBackFrame {
                    rx.asm.mark(RxError::FrameTiming);
                }
                self.push_rx(Self::record(&rx, FrameKind::Backward8));
                self.bit_timer.arm(FF_SETTLE[0]);
                self.state = State::PreIdle { reached: 1 };
            }
            24 => {
                // A forward frame inside our reply slot means the master
                // broke the minimum inter-frame time.
                if rx.from == LinkState::WaitForBackFrame {
                    rx.asm.mark(RxError::FrameTiming);
                }
                self.push_rx(Self::record(&rx, FrameKind::Forward24));
                let settle = self.rng.in_range(BF_SETTLE_MIN, BF_SETTLE_MAX);
                self.bit_timer.arm(settle);
                self.state = State::WaitToSendBackFrame { settle };
            }
            _ => {
                rx.asm.mark(RxError::FrameSize);
                self.push_rx(Self::record(&rx, FrameKind::Forward24));
                self.bit_timer.arm(FF_SETTLE[0]);
                self.state = State::PreIdle { reached: 1 };
            }
        }
    }

    fn record(rx: &Receive, kind: FrameKind) -> RxRecord {
        RxRecord {
            frame: rx.asm.packet(),
            length: rx.asm.len(),
            kind,
            done: true,
            error: rx.asm.error(),
            send_twice_possible: rx.twice_possible,
        }
    }

    // A full RX queue drops the record; the producing interrupt must not
    // block.
    fn push_rx(&mut self, record: RxRecord) {
        let _ = self.rx_queue.enqueue(record);
    }
}
