//! Simulated bus for the integration tests
//!
//! Owns virtual time, fires the armed bit timer, measures edge intervals
//! and loops the device's own transitions back into `on_edge`, the way
//! the real transceiver echoes the line. Tests inject external traffic
//! by pulling the simulated bus down and advancing time.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use dali2::time::TE;
use dali2::{
    BitTimer, DaliDevice, DaliLink, DeviceMode, EdgeTimer, Level, Line, NvmFlash, NvmError, Page,
    PAGE_SIZE,
};

pub type TestLink = DaliLink<SimLine, SimBitTimer, SimEdgeTimer>;
pub type TestDevice = DaliDevice<SimLine, SimBitTimer, SimEdgeTimer, RamNvm>;

/// Anything with the two link interrupt entry points.
pub trait DaliPort {
    fn isr_bit_tick(&mut self);
    fn isr_edge(&mut self);
}

impl DaliPort for TestLink {
    fn isr_bit_tick(&mut self) {
        self.on_bit_tick();
    }
    fn isr_edge(&mut self) {
        self.on_edge();
    }
}

impl DaliPort for TestDevice {
    fn isr_bit_tick(&mut self) {
        self.on_bit_tick();
    }
    fn isr_edge(&mut self) {
        self.on_edge();
    }
}

struct Shared {
    now: u64,
    device_low: bool,
    external_low: bool,
    bus_low: bool,
    pending_edges: u32,
    bit_epoch: u64,
    bit_reload: Option<u32>,
    edge_epoch: u64,
    transitions: Vec<(u64, bool)>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            now: 0,
            device_low: false,
            external_low: false,
            bus_low: false,
            pending_edges: 0,
            bit_epoch: 0,
            bit_reload: None,
            edge_epoch: 0,
            transitions: Vec::new(),
        }
    }

    fn recompute_bus(&mut self) {
        let low = self.device_low || self.external_low;
        if low != self.bus_low {
            self.bus_low = low;
            self.pending_edges += 1;
            self.transitions.push((self.now, low));
        }
    }
}

pub struct SimLine(Rc<RefCell<Shared>>);

impl Line for SimLine {
    fn drive(&mut self, level: Level) {
        let mut shared = self.0.borrow_mut();
        shared.device_low = level == Level::Low;
        shared.recompute_bus();
    }

    fn sense(&self) -> Level {
        if self.0.borrow().bus_low {
            Level::Low
        } else {
            Level::High
        }
    }
}

pub struct SimBitTimer(Rc<RefCell<Shared>>);

impl BitTimer for SimBitTimer {
    fn arm(&mut self, ticks: u32) {
        self.0.borrow_mut().bit_reload = Some(ticks);
    }
    fn disarm(&mut self) {
        self.0.borrow_mut().bit_reload = None;
    }
    fn now(&self) -> u32 {
        let shared = self.0.borrow();
        (shared.now - shared.bit_epoch) as u32
    }
    fn reset(&mut self) {
        let mut shared = self.0.borrow_mut();
        shared.bit_epoch = shared.now;
    }
    fn set_count(&mut self, ticks: u32) {
        let mut shared = self.0.borrow_mut();
        shared.bit_epoch = shared.now - ticks as u64;
    }
}

pub struct SimEdgeTimer(Rc<RefCell<Shared>>);

impl EdgeTimer for SimEdgeTimer {
    fn now(&self) -> u32 {
        let shared = self.0.borrow();
        (shared.now - shared.edge_epoch) as u32
    }
    fn reset(&mut self) {
        let mut shared = self.0.borrow_mut();
        shared.edge_epoch = shared.now;
    }
}

/// Flash behind four RAM pages.
pub struct RamNvm {
    pages: [[u8; PAGE_SIZE]; 4],
}

impl RamNvm {
    pub fn new() -> Self {
        RamNvm {
            pages: [[0xff; PAGE_SIZE]; 4],
        }
    }

    fn index(page: Page) -> usize {
        match page {
            Page::Variables => 0,
            Page::Rom => 1,
            Page::Bank0 => 2,
            Page::Bank189 => 3,
        }
    }
}

impl NvmFlash for RamNvm {
    fn read(&self, page: Page, offset: usize, buf: &mut [u8]) {
        let page = &self.pages[Self::index(page)];
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
    }

    fn erase(&mut self, page: Page) -> Result<(), NvmError> {
        self.pages[Self::index(page)] = [0xff; PAGE_SIZE];
        Ok(())
    }

    fn program(&mut self, page: Page, offset: usize, data: &[u8]) -> Result<(), NvmError> {
        let page = &mut self.pages[Self::index(page)];
        for (i, byte) in data.iter().enumerate() {
            page[offset + i] &= byte;
        }
        Ok(())
    }
}

pub struct Sim {
    shared: Rc<RefCell<Shared>>,
}

impl Sim {
    /// Current virtual time in ticks.
    pub fn now(&self) -> u64 {
        self.shared.borrow().now
    }

    /// Steps virtual time, firing the bit timer and delivering edges in
    /// order.
    pub fn advance<P: DaliPort>(&self, port: &mut P, ticks: u64) {
        let target = self.shared.borrow().now + ticks;
        loop {
            self.deliver_edges(port);
            let fire = {
                let shared = self.shared.borrow();
                shared.bit_reload.map(|d| shared.bit_epoch + d as u64)
            };
            match fire {
                Some(at) if at <= target => {
                    {
                        let mut shared = self.shared.borrow_mut();
                        shared.now = at;
                        // The up-counter wraps at the compare value.
                        shared.bit_epoch = at;
                    }
                    port.isr_bit_tick();
                }
                _ => break,
            }
        }
        self.shared.borrow_mut().now = target;
        self.deliver_edges(port);
    }

    /// Pulls the bus down (or releases it) from the test side.
    pub fn set_external<P: DaliPort>(&self, port: &mut P, low: bool) {
        {
            let mut shared = self.shared.borrow_mut();
            shared.external_low = low;
            shared.recompute_bus();
        }
        self.deliver_edges(port);
    }

    /// Takes and clears the recorded bus transitions.
    pub fn take_transitions(&self) -> Vec<(u64, bool)> {
        std::mem::take(&mut self.shared.borrow_mut().transitions)
    }

    /// Writes a whole frame onto the bus with nominal timing.
    pub fn inject_frame<P: DaliPort>(&self, port: &mut P, payload: u32, bits: u8) {
        self.inject_frame_with_start(port, payload, bits, TE)
    }

    /// Same, with a custom duration for the first start-bit half.
    pub fn inject_frame_with_start<P: DaliPort>(
        &self,
        port: &mut P,
        payload: u32,
        bits: u8,
        first_half: u32,
    ) {
        let mut halves = vec![true, false];
        for i in (0..bits).rev() {
            if payload >> i & 1 == 1 {
                halves.push(true);
                halves.push(false);
            } else {
                halves.push(false);
                halves.push(true);
            }
        }
        for (i, low) in halves.into_iter().enumerate() {
            self.set_external(port, low);
            let half = if i == 0 { first_half } else { TE };
            self.advance(port, half as u64);
        }
        self.set_external(port, false);
    }

    fn deliver_edges<P: DaliPort>(&self, port: &mut P) {
        loop {
            let pending = {
                let mut shared = self.shared.borrow_mut();
                if shared.pending_edges > 0 {
                    shared.pending_edges -= 1;
                    true
                } else {
                    false
                }
            };
            if !pending {
                break;
            }
            port.isr_edge();
        }
    }
}

pub fn sim_parts() -> (Sim, SimLine, SimBitTimer, SimEdgeTimer) {
    let shared = Rc::new(RefCell::new(Shared::new()));
    (
        Sim {
            shared: shared.clone(),
        },
        SimLine(shared.clone()),
        SimBitTimer(shared.clone()),
        SimEdgeTimer(shared),
    )
}

pub fn new_link() -> (Sim, TestLink) {
    let (sim, line, bit_timer, edge_timer) = sim_parts();
    let link = DaliLink::new(line, bit_timer, edge_timer, DeviceMode::InputDevice, 0x00c0_ffee);
    (sim, link)
}

pub fn new_device_with(nvm: RamNvm) -> (Sim, TestDevice) {
    let (sim, line, bit_timer, edge_timer) = sim_parts();
    let link = DaliLink::new(line, bit_timer, edge_timer, DeviceMode::InputDevice, 0x00c0_ffee);
    let device = DaliDevice::new(link, nvm, 0x1ee7_d411).expect("nvm provisioning");
    (sim, device)
}

pub fn new_device() -> (Sim, TestDevice) {
    new_device_with(RamNvm::new())
}

/// Builds a 24-bit command frame from its three bytes.
pub fn cmd24(address: u8, instance: u8, opcode: u8) -> u32 {
    ((address as u32) << 16) | ((instance as u32) << 8) | opcode as u32
}

/// Decodes every Manchester frame in a transition log into
/// `(payload, bit_count)` pairs.
pub fn decode_frames(transitions: &[(u64, bool)]) -> Vec<(u32, u8)> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i < transitions.len() {
        if !transitions[i].1 {
            i += 1;
            continue;
        }
        let mut phase = 0u8;
        let mut packet = 0u32;
        let mut len = 0u8;
        let mut prev = transitions[i].0;
        let mut j = i + 1;
        let mut ok = true;
        while j < transitions.len() {
            let gap = (transitions[j].0 - prev) as u32;
            if gap > 3 * TE {
                break;
            }
            let halves = if gap > TE + TE / 2 { 2 } else { 1 };
            match (phase, halves) {
                (0, 1) => phase = 3,
                (1, 1) => {
                    packet <<= 1;
                    len += 1;
                    phase = 4;
                }
                (2, 1) => {
                    packet = packet << 1 | 1;
                    len += 1;
                    phase = 3;
                }
                (3, 1) => phase = 2,
                (3, 2) => {
                    packet <<= 1;
                    len += 1;
                    phase = 4;
                }
                (4, 1) => phase = 1,
                (4, 2) => {
                    packet = packet << 1 | 1;
                    len += 1;
                    phase = 3;
                }
                _ => {
                    ok = false;
                    break;
                }
            }
            prev = transitions[j].0;
            j += 1;
        }
        if ok && len > 0 {
            frames.push((packet, len));
        }
        i = j.max(i + 1);
    }
    frames
}
