//! Screen device: two 2-bit pixel layers composed through a 4-color palette
//! into a BGRA framebuffer.
//!
//! The device owns the CPU side of the display bridge. The presentation
//! layer reads `pixels()` each frame and watches the shared resize flag to
//! learn when the logical resolution changed.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};
use uxn_core::{Uxn, RAM_SIZE};

use crate::bus::{peek2, poke2, Device, SLOT_SIZE};

pub type SharedScreen = Rc<RefCell<Screen>>;

/// Hard ceiling on either dimension, matching the presenter's fixed staging
/// image capacity.
pub const MAX_DIM: u16 = 1024;
const MIN_DIM: u16 = 8;

/// Sprite color blending: rows 0-3 map a 2-bit channel value through the
/// 4-bit draw color; row 4 flags whether channel 0 is opaque for that color.
const BLENDING: [[u8; 16]; 5] = [
    [0, 0, 0, 0, 1, 0, 1, 1, 2, 2, 0, 2, 3, 3, 3, 0],
    [0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3],
    [1, 2, 3, 1, 1, 2, 3, 1, 1, 2, 3, 1, 1, 2, 3, 1],
    [2, 3, 1, 2, 2, 3, 1, 2, 2, 3, 1, 2, 2, 3, 1, 2],
    [1, 1, 1, 1, 1, 0, 1, 1, 1, 1, 0, 1, 1, 1, 1, 0],
];

pub struct Screen {
    width: u16,
    height: u16,
    /// 2-bit color index per pixel, one byte each.
    bg: Vec<u8>,
    fg: Vec<u8>,
    /// Composed BGRA output, `width * height * 4` bytes.
    pixels: Vec<u8>,
    /// BGRA quad per color index.
    palette: [[u8; 4]; 4],
    resized: Arc<AtomicBool>,
}

impl Screen {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            bg: Vec::new(),
            fg: Vec::new(),
            pixels: Vec::new(),
            palette: [[0, 0, 0, 0xFF]; 4],
            // Starts raised so the first frame derives its geometry.
            resized: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn palette(&self) -> [[u8; 4]; 4] {
        self.palette
    }

    /// Raised by `resize`, cleared by the presentation loop once geometry
    /// has been rederived. Single writer, single reader.
    pub fn resize_flag(&self) -> Arc<AtomicBool> {
        self.resized.clone()
    }

    /// Reallocates the layers and framebuffer. Idempotent for unchanged
    /// dimensions; out-of-range requests are clamped so a misbehaving guest
    /// keeps running.
    pub fn resize(&mut self, width: u16, height: u16) {
        let w = width.clamp(MIN_DIM, MAX_DIM);
        let h = height.clamp(MIN_DIM, MAX_DIM);
        if w != width || h != height {
            warn!(width, height, "screen resize clamped to {w}x{h}");
        }
        if w == self.width && h == self.height {
            return;
        }
        self.width = w;
        self.height = h;
        let n = usize::from(w) * usize::from(h);
        self.bg = vec![0; n];
        self.fg = vec![0; n];
        self.pixels = vec![0; n * 4];
        self.resized.store(true, Ordering::Release);
        debug!(width = w, height = h, "screen resized");
    }

    /// Rebuilds the palette cache from the three big-endian color shorts
    /// (red, green, blue). Each color index takes one nibble per channel,
    /// duplicated to a full byte.
    pub fn set_palette(&mut self, rgb: [u16; 3]) {
        for (i, entry) in self.palette.iter_mut().enumerate() {
            let shift = 12 - 4 * i;
            let r = ((rgb[0] >> shift) & 0xF) as u8 * 0x11;
            let g = ((rgb[1] >> shift) & 0xF) as u8 * 0x11;
            let b = ((rgb[2] >> shift) & 0xF) as u8 * 0x11;
            *entry = [b, g, r, 0xFF];
        }
    }

    /// Composes both layers into the BGRA framebuffer. Foreground index 0
    /// is transparent.
    pub fn redraw(&mut self) {
        for (i, px) in self.pixels.chunks_exact_mut(4).enumerate() {
            let fg = self.fg[i];
            let color = if fg != 0 { fg } else { self.bg[i] };
            px.copy_from_slice(&self.palette[usize::from(color)]);
        }
    }

    fn dei_port(&self, slot: &[u8; SLOT_SIZE], port: u8) -> u8 {
        match port {
            0x2 => (self.width >> 8) as u8,
            0x3 => self.width as u8,
            0x4 => (self.height >> 8) as u8,
            0x5 => self.height as u8,
            _ => slot[usize::from(port)],
        }
    }

    fn deo_port(&mut self, ram: &[u8; RAM_SIZE], slot: &mut [u8; SLOT_SIZE], port: u8) {
        match port {
            0x3 => {
                let w = peek2(slot, 0x2);
                let h = self.height;
                self.resize(w, h);
            }
            0x5 => {
                let w = self.width;
                let h = peek2(slot, 0x4);
                self.resize(w, h);
            }
            0xE => self.pixel_op(slot),
            0xF => self.sprite_op(ram, slot),
            _ => {}
        }
    }

    /// Single-pixel draw or rectangle fill, per the pixel control byte:
    /// bit 7 fill mode, bit 6 layer select, bits 4-5 fill direction flips,
    /// bits 0-1 color.
    fn pixel_op(&mut self, slot: &mut [u8; SLOT_SIZE]) {
        let ctrl = slot[0xE];
        let color = ctrl & 0x3;
        let x = peek2(slot, 0x8);
        let y = peek2(slot, 0xA);
        let (w, h) = (self.width, self.height);
        let layer = if ctrl & 0x40 != 0 {
            &mut self.fg
        } else {
            &mut self.bg
        };
        if ctrl & 0x80 != 0 {
            let (x1, x2) = if ctrl & 0x10 != 0 { (0, x) } else { (x, w) };
            let (y1, y2) = if ctrl & 0x20 != 0 { (0, y) } else { (y, h) };
            fill(layer, w, h, x1, y1, x2, y2, color);
        } else {
            write_px(layer, w, h, x, y, color);
            let auto = slot[0x6];
            if auto & 0x1 != 0 {
                poke2(slot, 0x8, x.wrapping_add(1));
            }
            if auto & 0x2 != 0 {
                poke2(slot, 0xA, y.wrapping_add(1));
            }
        }
    }

    /// 8x8 tile draw, 1bpp or 2bpp, with flip bits and auto-advance. The
    /// auto byte packs the repeat count (high nibble) and the x/y/addr
    /// advance enables (bits 0-2).
    fn sprite_op(&mut self, ram: &[u8; RAM_SIZE], slot: &mut [u8; SLOT_SIZE]) {
        let ctrl = slot[0xF];
        let auto = slot[0x6];
        let length = u16::from(auto >> 4);
        let twobpp = ctrl & 0x80 != 0;
        let color = usize::from(ctrl & 0xF);
        let fx = ctrl & 0x10 != 0;
        let fy = ctrl & 0x20 != 0;
        let x = peek2(slot, 0x8);
        let y = peek2(slot, 0xA);
        let dx = u16::from(auto & 0x1) << 3;
        let dy = u16::from(auto & 0x2) << 2;
        let mut addr = peek2(slot, 0xC);
        let addr_incr = u16::from(auto & 0x4) << (1 + u16::from(twobpp));
        let (w, h) = (self.width, self.height);
        let layer = if ctrl & 0x40 != 0 {
            &mut self.fg
        } else {
            &mut self.bg
        };
        for i in 0..=length {
            let mut tile = [0u8; 16];
            for (j, byte) in tile.iter_mut().enumerate() {
                *byte = ram[usize::from(addr.wrapping_add(j as u16))];
            }
            let tx = x.wrapping_add(dy.wrapping_mul(i));
            let ty = y.wrapping_add(dx.wrapping_mul(i));
            if twobpp {
                draw_2bpp(layer, w, h, &tile, tx, ty, color, fx, fy);
            } else {
                draw_1bpp(layer, w, h, &tile[..8], tx, ty, color, fx, fy);
            }
            addr = addr.wrapping_add(addr_incr);
        }
        poke2(slot, 0xC, addr);
        if auto & 0x1 != 0 {
            poke2(slot, 0x8, x.wrapping_add(dx));
        }
        if auto & 0x2 != 0 {
            poke2(slot, 0xA, y.wrapping_add(dy));
        }
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SharedScreen {
    fn dei(&mut self, _uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8) -> u8 {
        self.borrow().dei_port(slot, port)
    }

    fn deo(&mut self, uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8, _value: u8) {
        self.borrow_mut().deo_port(&uxn.ram, slot, port)
    }
}

fn write_px(layer: &mut [u8], w: u16, h: u16, x: u16, y: u16, color: u8) {
    if x < w && y < h {
        layer[usize::from(x) + usize::from(y) * usize::from(w)] = color;
    }
}

#[allow(clippy::too_many_arguments)]
fn fill(layer: &mut [u8], w: u16, h: u16, x1: u16, y1: u16, x2: u16, y2: u16, color: u8) {
    for y in y1..y2 {
        for x in x1..x2 {
            write_px(layer, w, h, x, y, color);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_1bpp(
    layer: &mut [u8],
    w: u16,
    h: u16,
    sprite: &[u8],
    x1: u16,
    y1: u16,
    color: usize,
    fx: bool,
    fy: bool,
) {
    for row in 0..8u16 {
        let bits = sprite[usize::from(row)];
        let y = y1.wrapping_add(if fy { 7 - row } else { row });
        for col in 0..8u16 {
            let ch = (bits >> col) & 0x1;
            let x = x1.wrapping_add(if fx { col } else { 7 - col });
            if ch != 0 || BLENDING[4][color] != 0 {
                write_px(layer, w, h, x, y, BLENDING[usize::from(ch)][color]);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_2bpp(
    layer: &mut [u8],
    w: u16,
    h: u16,
    sprite: &[u8; 16],
    x1: u16,
    y1: u16,
    color: usize,
    fx: bool,
    fy: bool,
) {
    for row in 0..8u16 {
        let lo = sprite[usize::from(row)];
        let hi = sprite[usize::from(row) + 8];
        let y = y1.wrapping_add(if fy { 7 - row } else { row });
        for col in 0..8u16 {
            let ch = ((lo >> col) & 0x1) | (((hi >> col) << 1) & 0x2);
            let x = x1.wrapping_add(if fx { col } else { 7 - col });
            if ch != 0 || BLENDING[4][color] != 0 {
                write_px(layer, w, h, x, y, BLENDING[usize::from(ch)][color]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> [u8; SLOT_SIZE] {
        [0; SLOT_SIZE]
    }

    #[test]
    fn resize_is_idempotent_and_raises_the_flag() {
        let mut s = Screen::new();
        let flag = s.resize_flag();
        flag.store(false, Ordering::Release);

        s.resize(512, 320);
        assert_eq!((s.width(), s.height()), (512, 320));
        assert_eq!(s.pixels().len(), 512 * 320 * 4);
        assert!(flag.load(Ordering::Acquire));

        flag.store(false, Ordering::Release);
        s.resize(512, 320);
        assert!(!flag.load(Ordering::Acquire), "unchanged size must not re-raise");
    }

    #[test]
    fn resize_clamps_to_capacity_and_floor() {
        let mut s = Screen::new();
        s.resize(4000, 2);
        assert_eq!((s.width(), s.height()), (1024, 8));
    }

    #[test]
    fn palette_nibbles_expand_to_bgra_bytes() {
        let mut s = Screen::new();
        // Indexes decode to #000, #77f, #fdd, #262.
        s.set_palette([0x07F2, 0x07D6, 0x0FD2]);
        assert_eq!(s.palette()[0], [0x00, 0x00, 0x00, 0xFF]);
        assert_eq!(s.palette()[1], [0xFF, 0x77, 0x77, 0xFF]);
        assert_eq!(s.palette()[2], [0xDD, 0xDD, 0xFF, 0xFF]);
        assert_eq!(s.palette()[3], [0x22, 0x66, 0x22, 0xFF]);
    }

    #[test]
    fn pixel_op_draws_and_auto_advances() {
        let mut s = Screen::new();
        s.resize(16, 16);
        let mut d = slot();
        d[0x6] = 0x1; // auto x
        poke2(&mut d, 0x8, 3);
        poke2(&mut d, 0xA, 2);
        d[0xE] = 0x01; // bg, color 1
        s.pixel_op(&mut d);
        assert_eq!(s.bg[3 + 2 * 16], 1);
        assert_eq!(peek2(&d, 0x8), 4);
        assert_eq!(peek2(&d, 0xA), 2);
    }

    #[test]
    fn fill_covers_the_selected_quadrant() {
        let mut s = Screen::new();
        s.resize(8, 8);
        let mut d = slot();
        poke2(&mut d, 0x8, 4);
        poke2(&mut d, 0xA, 4);
        // Fill mode, flip-x and flip-y: covers [0,4)x[0,4).
        d[0xE] = 0x80 | 0x10 | 0x20 | 0x02;
        s.pixel_op(&mut d);
        for y in 0..8usize {
            for x in 0..8usize {
                let expect = if x < 4 && y < 4 { 2 } else { 0 };
                assert_eq!(s.bg[x + y * 8], expect, "({x},{y})");
            }
        }
    }

    #[test]
    fn foreground_zero_is_transparent_in_redraw() {
        let mut s = Screen::new();
        s.resize(8, 8);
        s.set_palette([0x0F00, 0x0F00, 0x0F00]);
        s.bg[0] = 1;
        s.redraw();
        // fg[0] is 0, so the bg color shows through.
        assert_eq!(&s.pixels()[..4], &s.palette()[1]);
        s.fg[0] = 2;
        s.redraw();
        assert_eq!(&s.pixels()[..4], &s.palette()[2]);
    }

    #[test]
    fn sprite_1bpp_draws_a_tile() {
        let mut s = Screen::new();
        s.resize(16, 16);
        let mut ram = Box::new([0u8; RAM_SIZE]);
        // Solid 8x8 tile at 0x2000.
        for i in 0..8 {
            ram[0x2000 + i] = 0xFF;
        }
        let mut d = slot();
        poke2(&mut d, 0x8, 0);
        poke2(&mut d, 0xA, 0);
        poke2(&mut d, 0xC, 0x2000);
        d[0xF] = 0x01; // 1bpp, bg, color 1
        s.sprite_op(&ram, &mut d);
        for y in 0..8usize {
            for x in 0..8usize {
                assert_eq!(s.bg[x + y * 16], BLENDING[1][1], "({x},{y})");
            }
        }
        // No auto bits: position registers unchanged, addr unchanged.
        assert_eq!(peek2(&d, 0x8), 0);
        assert_eq!(peek2(&d, 0xC), 0x2000);
    }

    #[test]
    fn sprite_auto_advance_moves_position_and_addr() {
        let mut s = Screen::new();
        s.resize(64, 64);
        let ram = Box::new([0u8; RAM_SIZE]);
        let mut d = slot();
        poke2(&mut d, 0x8, 8);
        poke2(&mut d, 0xA, 16);
        poke2(&mut d, 0xC, 0x1000);
        // auto: length 1 (two tiles), advance x and addr.
        d[0x6] = 0x15;
        d[0xF] = 0x01;
        s.sprite_op(&ram, &mut d);
        assert_eq!(peek2(&d, 0x8), 16);
        assert_eq!(peek2(&d, 0xA), 16);
        // 1bpp: addr steps 8 bytes per tile, two tiles drawn.
        assert_eq!(peek2(&d, 0xC), 0x1010);
    }

    #[test]
    fn width_registers_read_back_actual_size() {
        let mut s = Screen::new();
        s.resize(512, 320);
        let d = slot();
        assert_eq!(s.dei_port(&d, 0x2), 0x02);
        assert_eq!(s.dei_port(&d, 0x3), 0x00);
        assert_eq!(s.dei_port(&d, 0x4), 0x01);
        assert_eq!(s.dei_port(&d, 0x5), 0x40);
    }
}
