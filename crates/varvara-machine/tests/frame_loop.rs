//! End-to-end machine behavior: boot, per-frame vectors, input routing.

use varvara_machine::{BootError, FrameError, Machine, MachineConfig};

fn boot(rom: &[u8]) -> Machine {
    let mut machine = Machine::new(MachineConfig::default());
    machine.boot(rom).expect("boot");
    machine
}

/// A ROM whose reset vector runs `prelude` and installs `vector_code` at
/// 0x0120 as the vector for the given device slot.
fn rom_with_vector(prelude: &[u8], vector_port: u8, vector_code: &[u8]) -> Vec<u8> {
    let mut rom = prelude.to_vec();
    // LIT2 0x0120; LIT port; DEO2; BRK
    rom.extend_from_slice(&[0xa0, 0x01, 0x20, 0x80, vector_port, 0x37, 0x00]);
    assert!(rom.len() <= 0x20);
    rom.resize(0x20, 0);
    rom.extend_from_slice(vector_code);
    rom
}

#[test]
fn empty_rom_fails_boot() {
    let mut machine = Machine::new(MachineConfig::default());
    assert!(matches!(machine.boot(&[]), Err(BootError::EmptyRom)));
}

#[test]
fn pointer_clamps_inclusively_at_boot_size() {
    let mut machine = boot(&[0x00]);
    machine.pointer_moved(-10, 1000);
    assert_eq!(machine.bus().regs().peek2(0x92), 0);
    assert_eq!(machine.bus().regs().peek2(0x94), 320);

    // The boundary itself is reachable.
    machine.pointer_moved(512, 100);
    assert_eq!(machine.bus().regs().peek2(0x92), 512);
    assert_eq!(machine.bus().regs().peek2(0x94), 100);
}

#[test]
fn pointer_clamp_tracks_guest_resize() {
    // Reset vector sets width 256 then height 160.
    let mut machine = boot(&[
        0xa0, 0x01, 0x00, 0x80, 0x22, 0x37, // LIT2 0100; LIT 22; DEO2
        0xa0, 0x00, 0xa0, 0x80, 0x24, 0x37, // LIT2 00a0; LIT 24; DEO2
        0x00,
    ]);
    let screen = machine.screen();
    assert_eq!(screen.borrow().width(), 256);
    assert_eq!(screen.borrow().height(), 160);

    machine.pointer_moved(300, 50);
    assert_eq!(machine.bus().regs().peek2(0x92), 256);
    assert_eq!(machine.bus().regs().peek2(0x94), 50);
}

#[test]
fn pointer_buttons_translate_host_ids() {
    let mut machine = boot(&[0x00]);
    machine.pointer_button(0, true);
    assert_eq!(machine.bus().regs().get(0x96), 0x1);
    machine.pointer_button(1, true);
    assert_eq!(machine.bus().regs().get(0x96), 0x3);
    machine.pointer_button(0, false);
    assert_eq!(machine.bus().regs().get(0x96), 0x2);
}

#[test]
fn mouse_vector_runs_once_per_frame() {
    // Mouse vector increments the byte at zero page 0x10.
    let rom = rom_with_vector(
        &[],
        0x90,
        &[0x80, 0x10, 0x10, 0x01, 0x80, 0x10, 0x11, 0x00],
    );
    let mut machine = boot(&rom);

    machine.pointer_moved(1, 1);
    machine.pointer_moved(2, 2);
    machine.pointer_button(0, true);
    machine.frame().expect("frame");
    assert_eq!(machine.uxn().peek(0x10), 1, "burst of events, one eval");

    machine.frame().expect("frame");
    assert_eq!(machine.uxn().peek(0x10), 1, "no new input, no eval");

    machine.pointer_moved(3, 3);
    machine.frame().expect("frame");
    assert_eq!(machine.uxn().peek(0x10), 2);
}

#[test]
fn screen_vector_draw_reaches_the_framebuffer() {
    // Reset: palette red short 0x0f00, then install the screen vector.
    // Vector: x=1, y=1, pixel write to the foreground with color 1.
    let rom = rom_with_vector(
        &[0xa0, 0x0f, 0x00, 0x80, 0x08, 0x37],
        0x20,
        &[
            0xa0, 0x00, 0x01, 0x80, 0x28, 0x37, // x = 1
            0xa0, 0x00, 0x01, 0x80, 0x2a, 0x37, // y = 1
            0x80, 0x41, 0x80, 0x2e, 0x17, // pixel: fg, color 1
            0x00,
        ],
    );
    let mut machine = boot(&rom);
    machine.frame().expect("frame");

    let screen = machine.screen();
    let screen = screen.borrow();
    let idx = (1 + 1 * 512) * 4;
    // Palette index 1 decodes to pure red, BGRA order.
    assert_eq!(&screen.pixels()[idx..idx + 4], &[0x00, 0x00, 0xFF, 0xFF]);
    assert_eq!(&screen.pixels()[..4], &[0x00, 0x00, 0x00, 0xFF]);
}

#[test]
fn runaway_screen_vector_is_a_recoverable_frame_error() {
    // Screen vector jumps to itself forever.
    let rom = rom_with_vector(&[], 0x20, &[0x40, 0xff, 0xfd]);
    let mut machine = Machine::new(MachineConfig {
        step_budget: 1_000,
        ..MachineConfig::default()
    });
    machine.boot(&rom).expect("boot");

    let err = machine.frame().expect_err("budget overrun");
    assert!(matches!(err, FrameError::Vector { vector: "screen", .. }));

    // State survives; the next frame fails the same way instead of
    // poisoning the machine.
    assert_eq!(machine.screen().borrow().width(), 512);
    assert!(machine.frame().is_err());
    assert!(!machine.halted());
}

#[test]
fn guest_halt_is_observable() {
    // LIT 01; LIT 0f; DEO; BRK
    let mut machine = boot(&[0x80, 0x01, 0x80, 0x0f, 0x17, 0x00]);
    assert!(machine.halted());
}

#[test]
fn resize_flag_raised_on_boot_and_clearable() {
    let machine = boot(&[0x00]);
    let flag = machine.resize_flag();
    assert!(flag.load(std::sync::atomic::Ordering::Acquire));
    flag.store(false, std::sync::atomic::Ordering::Release);
    assert!(!flag.load(std::sync::atomic::Ordering::Acquire));
}
