//! End-to-end device behaviour over the simulated bus

mod common;

use common::*;
use dali2::time::{BF_SETTLE_MAX, BF_SETTLE_MIN, RX_STOP_MIN, SEND_TWICE_WINDOW, TE};
use dali2::InitialisationState;

const STOP_SLACK: u64 = (RX_STOP_MIN + 2 * TE) as u64;

// Injects a forward frame, lets the application process it and drains any
// scheduled reply before returning.
fn deliver(sim: &Sim, device: &mut TestDevice, frame: u32) {
    sim.inject_frame(device, frame, 24);
    sim.advance(device, STOP_SLACK);
    device.poll();
    sim.advance(device, 400_000);
    device.poll();
}

fn backframes(transitions: &[(u64, bool)]) -> Vec<u32> {
    decode_frames(transitions)
        .into_iter()
        .filter(|f| f.1 == 8)
        .map(|f| f.0)
        .collect()
}

#[test]
fn addressed_query_replies_with_the_input_value_high_byte() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 0x00)); // DTR0 = 0
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x14)); // SET SHORT ADDRESS
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x14));
    assert_eq!(device.short_address(), 0);

    device.set_input_value(0x1234);
    sim.inject_frame(&mut device, cmd24(0x01, 0x01, 0x8c), 24); // QUERY INPUT VALUE
    let stop_base = sim.now();
    sim.advance(&mut device, RX_STOP_MIN as u64 + 1_000);
    device.poll();
    sim.take_transitions();
    sim.advance(&mut device, 400_000);

    let transitions = sim.take_transitions();
    assert_eq!(backframes(&transitions), vec![0x12]);
    // The reply must start inside the settling window after the stop
    // condition.
    let classify_at = stop_base + RX_STOP_MIN as u64;
    let start = transitions.iter().find(|t| t.1).expect("backframe").0;
    assert!(start >= classify_at + BF_SETTLE_MIN as u64);
    assert!(start <= classify_at + BF_SETTLE_MAX as u64);
}

#[test]
fn initialise_and_randomise_need_two_copies() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xc1, 0x01, 0xff)); // INITIALISE, all devices
    assert_eq!(device.initialisation_state(), InitialisationState::Disabled);
    deliver(&sim, &mut device, cmd24(0xc1, 0x01, 0xff));
    assert_eq!(device.initialisation_state(), InitialisationState::Enabled);

    // A single RANDOMISE runs out its window and changes nothing.
    deliver(&sim, &mut device, cmd24(0xc1, 0x02, 0x00));
    sim.advance(&mut device, SEND_TWICE_WINDOW as u64 + 200_000);
    device.poll();
    assert_eq!(device.random_address(), 0xff_ffff);
    assert!(device.reset_state());

    // Clear the stale comparison frame with an unrelated query, then the
    // repeated RANDOMISE takes effect.
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x30)); // QUERY DEVICE STATUS
    deliver(&sim, &mut device, cmd24(0xc1, 0x02, 0x00));
    deliver(&sim, &mut device, cmd24(0xc1, 0x02, 0x00));
    assert_ne!(device.random_address(), 0xff_ffff);
    assert!(!device.reset_state());

    // The initialisation window closes after 15 minutes.
    for _ in 0..(15 * 60_000) {
        device.tick_1ms();
    }
    assert_eq!(device.initialisation_state(), InitialisationState::Disabled);
}

#[test]
fn commissioning_dance_assigns_a_short_address() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xc1, 0x01, 0xff));
    deliver(&sim, &mut device, cmd24(0xc1, 0x01, 0xff));
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x30)); // clears the comparison frame
    deliver(&sim, &mut device, cmd24(0xc1, 0x02, 0x00));
    deliver(&sim, &mut device, cmd24(0xc1, 0x02, 0x00));
    let random = device.random_address();

    // Walk the search address onto the random address.
    deliver(&sim, &mut device, cmd24(0xc1, 0x05, (random >> 16) as u8));
    deliver(&sim, &mut device, cmd24(0xc1, 0x06, (random >> 8) as u8));
    sim.take_transitions();
    deliver(&sim, &mut device, cmd24(0xc1, 0x07, random as u8));
    deliver(&sim, &mut device, cmd24(0xc1, 0x03, 0x00)); // COMPARE
    assert_eq!(backframes(&sim.take_transitions()), vec![0xff]);

    deliver(&sim, &mut device, cmd24(0xc1, 0x08, 0x2a)); // PROGRAM SHORT ADDRESS
    sim.take_transitions();
    deliver(&sim, &mut device, cmd24(0xc1, 0x09, 0x2a)); // VERIFY SHORT ADDRESS
    assert_eq!(backframes(&sim.take_transitions()), vec![0xff]);
    assert_eq!(device.short_address(), 0x2a);

    deliver(&sim, &mut device, cmd24(0xc1, 0x04, 0x00)); // WITHDRAW
    assert_eq!(device.initialisation_state(), InitialisationState::Withdrawn);
    sim.take_transitions();
    deliver(&sim, &mut device, cmd24(0xc1, 0x03, 0x00)); // COMPARE is now ignored
    assert_eq!(backframes(&sim.take_transitions()), Vec::<u32>::new());
}

#[test]
fn memory_write_protocol() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x15)); // ENABLE WRITE MEMORY
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x15));
    deliver(&sim, &mut device, cmd24(0xc1, 0x31, 189)); // DTR1 = bank
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 2)); // DTR0 = lock byte
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x55)); // unlock the bank
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x00)); // clear the parameter lock
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 5)); // DTR0 = 5

    sim.take_transitions();
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x42)); // WRITE MEMORY LOCATION
    assert_eq!(backframes(&sim.take_transitions()), vec![0x42]);
    assert_eq!(device.store().read(189, 5), Some(0x42));
    assert_eq!(device.dtr(), (6, 189, 0));
}

#[test]
fn read_memory_walks_bank0() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xc1, 0x31, 0)); // DTR1 = bank 0
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 0x03)); // DTR0 = first GTIN byte
    sim.take_transitions();
    for _ in 0..6 {
        deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x3c)); // READ MEMORY LOCATION
    }
    assert_eq!(
        backframes(&sim.take_transitions()),
        vec![0x00, 0xc8, 0x3c, 0x58, 0x86, 0x4a]
    );
    assert_eq!(device.dtr().0, 0x09);
}

#[test]
fn power_cycle_notification_after_reboot() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 5)); // DTR0 = 5
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x14)); // short address = 5
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x14));
    deliver(&sim, &mut device, cmd24(0xc1, 0x31, 0x08)); // DTR1 = group 3 mask
    deliver(&sim, &mut device, cmd24(0xc1, 0x32, 0x00)); // DTR2 = 0
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x19)); // ADD TO DEVICE GROUPS 0-15
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x19));
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x1f)); // ENABLE POWER CYCLE NOTIFICATION
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x1f));

    // Power cycle: same flash, fresh bus and link.
    let (_link, nvm) = device.free();
    let (sim, mut device) = new_device_with(nvm);
    for _ in 0..1_200 {
        device.tick_1ms();
    }
    device.poll();
    sim.advance(&mut device, 400_000);

    let frames = decode_frames(&sim.take_transitions());
    let expected = 0xfe_e000 | (1 << 12) | (3 << 7) | (1 << 6) | 5;
    assert_eq!(
        frames.iter().filter(|f| f.1 == 24).map(|f| f.0).collect::<Vec<_>>(),
        vec![expected]
    );
}

#[test]
fn hysteresis_gates_input_events() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 0)); // DTR0 = 0
    deliver(&sim, &mut device, cmd24(0xff, 0x01, 0x32)); // SET DEADTIME TIMER
    deliver(&sim, &mut device, cmd24(0xff, 0x01, 0x32));
    sim.take_transitions();

    device.update_input(500);
    sim.advance(&mut device, 500_000);
    device.update_input(520); // inside max(10, 5% of 500)
    sim.advance(&mut device, 500_000);
    device.update_input(550); // outside the band
    sim.advance(&mut device, 500_000);

    let events: Vec<u32> = decode_frames(&sim.take_transitions())
        .into_iter()
        .filter(|f| f.1 == 24 && f.0 & 0x01_0000 == 0)
        .map(|f| f.0)
        .collect();
    let expected = |value: u32| 0x80_0000 | (4 << 17) | 0x8000 | (1 << 10) | (value >> 6);
    assert_eq!(events, vec![expected(500), expected(550)]);
}

#[test]
fn quiescent_mode_suppresses_events_for_fifteen_minutes() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 0));
    deliver(&sim, &mut device, cmd24(0xff, 0x01, 0x32)); // deadtime = 0
    deliver(&sim, &mut device, cmd24(0xff, 0x01, 0x32));
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x1d)); // START QUIESCENT MODE
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x1d));
    assert!(device.quiescent_mode());

    sim.take_transitions();
    device.update_input(500);
    sim.advance(&mut device, 500_000);
    assert!(decode_frames(&sim.take_transitions()).is_empty());

    for _ in 0..(15 * 60_000) {
        device.tick_1ms();
    }
    assert!(!device.quiescent_mode());
    device.update_input(600);
    sim.advance(&mut device, 500_000);
    assert!(!decode_frames(&sim.take_transitions()).is_empty());
}

#[test]
fn factory_reset_restores_bank_defaults() {
    let (sim, mut device) = new_device();
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x15));
    deliver(&sim, &mut device, cmd24(0xff, 0xfe, 0x15));
    deliver(&sim, &mut device, cmd24(0xc1, 0x31, 189));
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 2));
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x55)); // unlock
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x00)); // parameter lock off
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 5));
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x42)); // scribble on offset 5
    assert_eq!(device.store().read(189, 5), Some(0x42));

    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 4)); // DTR0 = factory reset byte
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x00));
    // Calibration scale is back at its default and the bank is locked.
    assert_eq!(device.store().read(189, 5), Some(255));
    deliver(&sim, &mut device, cmd24(0xc1, 0x30, 5));
    deliver(&sim, &mut device, cmd24(0xc1, 0x20, 0x77));
    assert_eq!(device.store().read(189, 5), Some(255));
}
