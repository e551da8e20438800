//! Port register file and device bus dispatcher.
//!
//! The 256-byte port space is partitioned into sixteen 16-byte slots keyed
//! by the high nibble of the address. Dispatch goes through a fixed table of
//! optional [`Device`] handlers; a slot without a handler behaves as plain
//! memory. Bus calls never fail: devices that touch fallible host resources
//! report outcomes through their own status registers.

use std::cell::RefCell;
use std::rc::Rc;

use uxn_core::Uxn;

use crate::audio::AudioStub;
use crate::console::ConsoleDevice;
use crate::datetime::DatetimeDevice;
use crate::file::FileDevice;
use crate::screen::{Screen, SharedScreen};
use crate::system::SystemDevice;

pub const SLOT_SIZE: usize = 0x10;
pub const SLOT_COUNT: usize = 0x10;

/// Reads a big-endian short from a slot window.
pub(crate) fn peek2(slot: &[u8; SLOT_SIZE], port: usize) -> u16 {
    u16::from_be_bytes([slot[port], slot[(port + 1) & 0xF]])
}

/// Writes a big-endian short into a slot window.
pub(crate) fn poke2(slot: &mut [u8; SLOT_SIZE], port: usize, value: u16) {
    let [hi, lo] = value.to_be_bytes();
    slot[port] = hi;
    slot[(port + 1) & 0xF] = lo;
}

/// A device model mounted on one 16-byte slot of the port space.
///
/// `port` is the low nibble of the address. On writes the byte has already
/// been stored into the slot window before the handler runs, so handlers may
/// read their own registers and always observe the new value.
pub trait Device {
    fn dei(&mut self, uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8) -> u8 {
        let _ = uxn;
        slot[usize::from(port)]
    }

    fn deo(&mut self, uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8, value: u8) {
        let _ = (uxn, slot, port, value);
    }
}

/// The full port space, stored slot-major so handlers can be handed a
/// bounded window instead of the whole file.
pub struct Registers {
    slots: [[u8; SLOT_SIZE]; SLOT_COUNT],
}

impl Registers {
    pub fn new() -> Self {
        Self {
            slots: [[0; SLOT_SIZE]; SLOT_COUNT],
        }
    }

    pub fn get(&self, address: u8) -> u8 {
        self.slots[usize::from(address >> 4)][usize::from(address & 0xF)]
    }

    pub fn set(&mut self, address: u8, value: u8) {
        self.slots[usize::from(address >> 4)][usize::from(address & 0xF)] = value;
    }

    /// Big-endian short at `address`; the second byte wraps within the file.
    pub fn peek2(&self, address: u8) -> u16 {
        u16::from_be_bytes([self.get(address), self.get(address.wrapping_add(1))])
    }

    pub fn poke2(&mut self, address: u8, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.set(address, hi);
        self.set(address.wrapping_add(1), lo);
    }

    pub fn slot_mut(&mut self, slot: u8) -> &mut [u8; SLOT_SIZE] {
        &mut self.slots[usize::from(slot)]
    }

    /// The three palette shorts from the system slot (red, green, blue).
    pub fn system_palette(&self) -> [u16; 3] {
        [self.peek2(0x08), self.peek2(0x0A), self.peek2(0x0C)]
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

/// Input vectors whose registers changed since the last frame. The frame
/// driver runs each pending vector once, so a burst of host events costs a
/// single evaluation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingInput {
    pub console: bool,
    pub controller: bool,
    pub mouse: bool,
}

impl PendingInput {
    pub fn any(&self) -> bool {
        self.console || self.controller || self.mouse
    }
}

pub struct VarvaraBus {
    regs: Registers,
    handlers: [Option<Box<dyn Device>>; SLOT_COUNT],
    screen: SharedScreen,
    pending: PendingInput,
}

impl VarvaraBus {
    /// Builds the bus with the standard device mounts: system at slot 0x0,
    /// console 0x1, screen 0x2, audio placeholders 0x3-0x6, file devices
    /// 0xA/0xB, datetime 0xC. Controller (0x8) and mouse (0x9) have no
    /// handler; their registers are written by the host-side push methods.
    pub fn new() -> Self {
        let screen: SharedScreen = Rc::new(RefCell::new(Screen::new()));
        let mut handlers: [Option<Box<dyn Device>>; SLOT_COUNT] =
            std::array::from_fn(|_| None);
        handlers[0x0] = Some(Box::new(SystemDevice));
        handlers[0x1] = Some(Box::new(ConsoleDevice));
        handlers[0x2] = Some(Box::new(screen.clone()));
        for slot in 0x3..=0x6 {
            handlers[slot] = Some(Box::new(AudioStub::new(slot as u8)));
        }
        handlers[0xA] = Some(Box::new(FileDevice::new(0)));
        handlers[0xB] = Some(Box::new(FileDevice::new(1)));
        handlers[0xC] = Some(Box::new(DatetimeDevice));
        Self {
            regs: Registers::new(),
            handlers,
            screen,
            pending: PendingInput::default(),
        }
    }

    /// A bus with an empty handler table; every slot behaves as raw memory.
    #[cfg(test)]
    pub(crate) fn inert() -> Self {
        Self {
            regs: Registers::new(),
            handlers: std::array::from_fn(|_| None),
            screen: Rc::new(RefCell::new(Screen::new())),
            pending: PendingInput::default(),
        }
    }

    pub fn screen(&self) -> SharedScreen {
        self.screen.clone()
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    /// Nonzero system state register ends the run loop.
    pub fn halt_requested(&self) -> bool {
        self.regs.get(0x0F) != 0
    }

    pub fn screen_vector(&self) -> u16 {
        self.regs.peek2(0x20)
    }

    pub fn console_vector(&self) -> u16 {
        self.regs.peek2(0x10)
    }

    pub fn controller_vector(&self) -> u16 {
        self.regs.peek2(0x80)
    }

    pub fn mouse_vector(&self) -> u16 {
        self.regs.peek2(0x90)
    }

    pub fn take_pending(&mut self) -> PendingInput {
        std::mem::take(&mut self.pending)
    }

    /// Stores an already-clamped pointer position and marks the mouse
    /// vector pending.
    pub fn mouse_position(&mut self, x: u16, y: u16) {
        self.regs.poke2(0x92, x);
        self.regs.poke2(0x94, y);
        self.pending.mouse = true;
    }

    /// Sets or clears one bit of the mouse button state register. The mask
    /// is the device-side value, already translated from the host id.
    pub fn mouse_button(&mut self, mask: u8, pressed: bool) {
        let state = self.regs.get(0x96);
        let state = if pressed { state | mask } else { state & !mask };
        self.regs.set(0x96, state);
        self.pending.mouse = true;
    }

    pub fn mouse_scroll(&mut self, dx: i16, dy: i16) {
        self.regs.poke2(0x9A, dx as u16);
        self.regs.poke2(0x9C, dy.wrapping_neg() as u16);
        self.pending.mouse = true;
    }

    /// Scroll deltas are one-shot; the frame driver clears them after the
    /// mouse vector has seen them.
    pub fn clear_mouse_scroll(&mut self) {
        self.regs.poke2(0x9A, 0);
        self.regs.poke2(0x9C, 0);
    }

    pub fn controller_button(&mut self, mask: u8, pressed: bool) {
        let state = self.regs.get(0x82);
        let state = if pressed { state | mask } else { state & !mask };
        self.regs.set(0x82, state);
        self.pending.controller = true;
    }

    pub fn controller_key(&mut self, key: u8) {
        self.regs.set(0x83, key);
        self.pending.controller = true;
    }

    pub fn clear_controller_key(&mut self) {
        self.regs.set(0x83, 0);
    }

    pub fn console_input(&mut self, byte: u8) {
        self.regs.set(0x12, byte);
        self.pending.console = true;
    }

    #[cfg(test)]
    fn set_handler(&mut self, slot: u8, device: Box<dyn Device>) {
        self.handlers[usize::from(slot)] = Some(device);
    }
}

impl Default for VarvaraBus {
    fn default() -> Self {
        Self::new()
    }
}

impl uxn_core::DeviceBus for VarvaraBus {
    fn dei(&mut self, uxn: &mut Uxn, address: u8) -> u8 {
        let slot = address >> 4;
        let port = address & 0xF;
        match self.handlers[usize::from(slot)].as_deref_mut() {
            Some(handler) => handler.dei(uxn, self.regs.slot_mut(slot), port),
            None => self.regs.get(address),
        }
    }

    fn deo(&mut self, uxn: &mut Uxn, address: u8, value: u8) {
        let slot = address >> 4;
        let port = address & 0xF;
        // Store first: handlers and later reads must observe the new byte.
        self.regs.set(address, value);
        if let Some(handler) = self.handlers[usize::from(slot)].as_deref_mut() {
            handler.deo(uxn, self.regs.slot_mut(slot), port, value);
        }
        // Palette sub-registers live on the system device but feed the
        // screen's cached palette.
        if slot == 0x0 && (0x08..=0x0D).contains(&port) {
            self.screen
                .borrow_mut()
                .set_palette(self.regs.system_palette());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uxn_core::DeviceBus;

    #[test]
    fn unhandled_slots_keep_raw_bytes_across_the_whole_space() {
        let mut bus = VarvaraBus::inert();
        let mut uxn = Uxn::new();
        for addr in 0..=0xFFu16 {
            let addr = addr as u8;
            bus.deo(&mut uxn, addr, addr ^ 0x5A);
        }
        for addr in 0..=0xFFu16 {
            let addr = addr as u8;
            assert_eq!(bus.dei(&mut uxn, addr), addr ^ 0x5A);
        }
    }

    #[test]
    fn default_bus_leaves_mouse_and_controller_slots_raw() {
        let mut bus = VarvaraBus::new();
        let mut uxn = Uxn::new();
        bus.deo(&mut uxn, 0x96, 0x07);
        bus.deo(&mut uxn, 0x82, 0x11);
        bus.deo(&mut uxn, 0xD4, 0x99);
        assert_eq!(bus.dei(&mut uxn, 0x96), 0x07);
        assert_eq!(bus.dei(&mut uxn, 0x82), 0x11);
        assert_eq!(bus.dei(&mut uxn, 0xD4), 0x99);
    }

    #[test]
    fn audio_slots_read_zero_deterministically() {
        let mut bus = VarvaraBus::new();
        let mut uxn = Uxn::new();
        for slot in 0x3..=0x6u8 {
            let addr = slot << 4 | 0x2;
            bus.deo(&mut uxn, addr, 0xAB);
            assert_eq!(bus.dei(&mut uxn, addr), 0);
            // The raw byte is still stored underneath.
            assert_eq!(bus.regs().get(addr), 0xAB);
        }
    }

    #[test]
    fn writes_store_before_handler_dispatch() {
        struct Probe {
            seen: Rc<RefCell<Vec<u8>>>,
        }
        impl Device for Probe {
            fn deo(&mut self, _uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8, _value: u8) {
                self.seen.borrow_mut().push(slot[usize::from(port)]);
            }
        }
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = VarvaraBus::inert();
        bus.set_handler(0x7, Box::new(Probe { seen: seen.clone() }));
        let mut uxn = Uxn::new();
        bus.deo(&mut uxn, 0x73, 0xCD);
        assert_eq!(*seen.borrow(), vec![0xCD]);
    }

    #[test]
    fn palette_writes_refresh_the_screen_cache() {
        let mut bus = VarvaraBus::new();
        let mut uxn = Uxn::new();
        // Color index 0 gets the top nibbles: r=0xF, g=0x0, b=0x8.
        bus.deo(&mut uxn, 0x08, 0xF0);
        bus.deo(&mut uxn, 0x0A, 0x00);
        bus.deo(&mut uxn, 0x0C, 0x80);
        let screen = bus.screen();
        let palette = screen.borrow().palette();
        assert_eq!(palette[0], [0x88, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn input_pushes_mark_vectors_pending() {
        let mut bus = VarvaraBus::new();
        bus.mouse_position(10, 20);
        bus.controller_key(b'q');
        let pending = bus.take_pending();
        assert!(pending.mouse);
        assert!(pending.controller);
        assert!(!pending.console);
        // Taking clears.
        assert!(!bus.take_pending().any());
        assert_eq!(bus.regs().peek2(0x92), 10);
        assert_eq!(bus.regs().peek2(0x94), 20);
        assert_eq!(bus.regs().get(0x83), b'q');
    }

    #[test]
    fn mouse_buttons_accumulate_and_release() {
        let mut bus = VarvaraBus::new();
        bus.mouse_button(0x1, true);
        bus.mouse_button(0x2, true);
        assert_eq!(bus.regs().get(0x96), 0x3);
        bus.mouse_button(0x1, false);
        assert_eq!(bus.regs().get(0x96), 0x2);
    }

    #[test]
    fn scroll_deltas_are_stored_negated_vertically() {
        let mut bus = VarvaraBus::new();
        bus.mouse_scroll(3, 2);
        assert_eq!(bus.regs().peek2(0x9A), 3);
        assert_eq!(bus.regs().peek2(0x9C), (-2i16) as u16);
        bus.clear_mouse_scroll();
        assert_eq!(bus.regs().peek2(0x9A), 0);
        assert_eq!(bus.regs().peek2(0x9C), 0);
    }

    #[test]
    fn halt_register_is_visible() {
        let mut bus = VarvaraBus::new();
        let mut uxn = Uxn::new();
        assert!(!bus.halt_requested());
        bus.deo(&mut uxn, 0x0F, 0x01);
        assert!(bus.halt_requested());
    }
}
