//! Machine composition: CPU state, device bus, boot, per-frame vector
//! driving, and the host-facing input router.

#![forbid(unsafe_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use uxn_core::{Fault, Uxn, PAGE_PROGRAM};
use varvara_devices::{SharedScreen, VarvaraBus};

/// Default instruction budget per vector evaluation.
pub const DEFAULT_STEP_BUDGET: u64 = 1 << 24;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Boot framebuffer size.
    pub width: u16,
    pub height: u16,
    /// Instruction budget per vector evaluation; 0 disables the bound.
    pub step_budget: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            width: 64 * 8,
            height: 40 * 8,
            step_budget: DEFAULT_STEP_BUDGET,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("rom image is empty")]
    EmptyRom,
    #[error("reset vector failed: {0}")]
    Reset(#[source] Fault),
}

/// A recoverable per-frame failure: the frame's render is skipped, machine
/// state is kept, and the loop continues.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("{vector} vector failed: {fault}")]
    Vector {
        vector: &'static str,
        #[source]
        fault: Fault,
    },
}

/// Host-side controller buttons, mapped to the device's button mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerButton {
    A,
    B,
    Select,
    Home,
    Up,
    Down,
    Left,
    Right,
}

impl ControllerButton {
    pub fn mask(self) -> u8 {
        match self {
            ControllerButton::A => 0x01,
            ControllerButton::B => 0x02,
            ControllerButton::Select => 0x04,
            ControllerButton::Home => 0x08,
            ControllerButton::Up => 0x10,
            ControllerButton::Down => 0x20,
            ControllerButton::Left => 0x40,
            ControllerButton::Right => 0x80,
        }
    }
}

pub struct Machine {
    config: MachineConfig,
    uxn: Uxn,
    bus: VarvaraBus,
    screen: SharedScreen,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let bus = VarvaraBus::new();
        let screen = bus.screen();
        Self {
            config,
            uxn: Uxn::new(),
            bus,
            screen,
        }
    }

    pub fn uxn(&self) -> &Uxn {
        &self.uxn
    }

    pub fn bus(&self) -> &VarvaraBus {
        &self.bus
    }

    pub fn screen(&self) -> SharedScreen {
        self.screen.clone()
    }

    /// Raised by the screen device on resolution change; the presentation
    /// loop clears it after rederiving geometry.
    pub fn resize_flag(&self) -> Arc<AtomicBool> {
        self.screen.borrow().resize_flag()
    }

    /// The guest asked to stop via the system state register.
    pub fn halted(&self) -> bool {
        self.bus.halt_requested()
    }

    /// Loads the ROM at the program page and runs the reset vector once.
    pub fn boot(&mut self, rom: &[u8]) -> Result<(), BootError> {
        if rom.is_empty() {
            return Err(BootError::EmptyRom);
        }
        let loaded = self.uxn.load_rom(rom);
        if loaded < rom.len() {
            warn!(rom = rom.len(), loaded, "rom truncated to fit ram");
        }
        self.screen
            .borrow_mut()
            .resize(self.config.width, self.config.height);
        self.uxn
            .eval(&mut self.bus, PAGE_PROGRAM, self.config.step_budget)
            .map_err(BootError::Reset)?;
        Ok(())
    }

    /// Runs one displayable frame: each pending input vector once, then the
    /// screen vector, then recomposes the framebuffer. On error the caller
    /// skips the frame's render and keeps going.
    pub fn frame(&mut self) -> Result<(), FrameError> {
        let pending = self.bus.take_pending();
        if pending.console {
            let vector = self.bus.console_vector();
            self.run_vector("console", vector)?;
        }
        if pending.controller {
            let vector = self.bus.controller_vector();
            let res = self.run_vector("controller", vector);
            // The key register is one-shot; clear it whether or not the
            // vector completed.
            self.bus.clear_controller_key();
            res?;
        }
        if pending.mouse {
            let vector = self.bus.mouse_vector();
            let res = self.run_vector("mouse", vector);
            self.bus.clear_mouse_scroll();
            res?;
        }
        let vector = self.bus.screen_vector();
        self.run_vector("screen", vector)?;
        self.screen.borrow_mut().redraw();
        Ok(())
    }

    fn run_vector(&mut self, name: &'static str, entry: u16) -> Result<(), FrameError> {
        self.uxn
            .eval(&mut self.bus, entry, self.config.step_budget)
            .map(|_| ())
            .map_err(|fault| {
                warn!(vector = name, %fault, "vector aborted");
                FrameError::Vector {
                    vector: name,
                    fault,
                }
            })
    }

    /// Pointer position in frame coordinates, clamped inclusively to
    /// `[0, width] x [0, height]` against the current framebuffer size.
    pub fn pointer_moved(&mut self, x: i32, y: i32) {
        let (w, h) = {
            let screen = self.screen.borrow();
            (screen.width(), screen.height())
        };
        let cx = x.clamp(0, i32::from(w)) as u16;
        let cy = y.clamp(0, i32::from(h)) as u16;
        self.bus.mouse_position(cx, cy);
    }

    /// Host button ids number from 0; the device mask value is `id + 1`.
    pub fn pointer_button(&mut self, id: u8, pressed: bool) {
        self.bus.mouse_button(id.wrapping_add(1), pressed);
    }

    pub fn pointer_scroll(&mut self, dx: i16, dy: i16) {
        self.bus.mouse_scroll(dx, dy);
    }

    pub fn controller_button(&mut self, button: ControllerButton, pressed: bool) {
        self.bus.controller_button(button.mask(), pressed);
    }

    pub fn controller_key(&mut self, key: u8) {
        self.bus.controller_key(key);
    }

    pub fn console_input(&mut self, byte: u8) {
        self.bus.console_input(byte);
    }
}
