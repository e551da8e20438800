//! System device: stack introspection, RAM expansion ops, debug dump, and
//! the state register the run loop polls for halt. The palette shorts also
//! live on this slot; the bus forwards them to the screen cache.

use tracing::debug;
use uxn_core::Uxn;

use crate::bus::{peek2, Device, SLOT_SIZE};

pub struct SystemDevice;

impl Device for SystemDevice {
    fn dei(&mut self, uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8) -> u8 {
        match port {
            0x4 => uxn.wst.ptr(),
            0x5 => uxn.rst.ptr(),
            _ => slot[usize::from(port)],
        }
    }

    fn deo(&mut self, uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8, _value: u8) {
        match port {
            0x3 => expansion(uxn, peek2(slot, 0x2)),
            0x4 => uxn.wst.set_ptr(slot[0x4]),
            0x5 => uxn.rst.set_ptr(slot[0x5]),
            0xE => debug!(wst = ?uxn.wst.used(), rst = ?uxn.rst.used(), "state dump"),
            _ => {}
        }
    }
}

/// RAM expansion command. The operand block at `addr` starts with an opcode
/// byte followed by big-endian shorts; page operands are accepted but
/// ignored since RAM is a single page.
fn expansion(uxn: &mut Uxn, addr: u16) {
    let op = uxn.peek(addr);
    match op {
        // fill: length, dst page, dst addr, value
        0x0 => {
            let length = uxn.peek2(addr.wrapping_add(1));
            let dst = uxn.peek2(addr.wrapping_add(5));
            let value = uxn.peek(addr.wrapping_add(7));
            for i in 0..length {
                uxn.poke(dst.wrapping_add(i), value);
            }
        }
        // cpyl: ascending copy, safe when dst < src overlaps
        0x1 => {
            let length = uxn.peek2(addr.wrapping_add(1));
            let src = uxn.peek2(addr.wrapping_add(5));
            let dst = uxn.peek2(addr.wrapping_add(9));
            for i in 0..length {
                let byte = uxn.peek(src.wrapping_add(i));
                uxn.poke(dst.wrapping_add(i), byte);
            }
        }
        // cpyr: descending copy, safe when dst > src overlaps
        0x2 => {
            let length = uxn.peek2(addr.wrapping_add(1));
            let src = uxn.peek2(addr.wrapping_add(5));
            let dst = uxn.peek2(addr.wrapping_add(9));
            for i in (0..length).rev() {
                let byte = uxn.peek(src.wrapping_add(i));
                uxn.poke(dst.wrapping_add(i), byte);
            }
        }
        _ => debug!(op, addr, "unknown expansion opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_pointer_registers() {
        let mut uxn = Uxn::new();
        uxn.wst.push(1);
        uxn.wst.push(2);
        uxn.rst.push(3);
        let mut dev = SystemDevice;
        let mut slot = [0u8; SLOT_SIZE];
        assert_eq!(dev.dei(&mut uxn, &mut slot, 0x4), 2);
        assert_eq!(dev.dei(&mut uxn, &mut slot, 0x5), 1);

        slot[0x4] = 0;
        dev.deo(&mut uxn, &mut slot, 0x4, 0);
        assert_eq!(uxn.wst.ptr(), 0);
    }

    #[test]
    fn expansion_fill() {
        let mut uxn = Uxn::new();
        // fill: length 4, page 0, dst 0x3000, value 0xAA
        let block = [0x00, 0x00, 0x04, 0x00, 0x00, 0x30, 0x00, 0xAA];
        for (i, b) in block.iter().enumerate() {
            uxn.poke(0x2000 + i as u16, *b);
        }
        expansion(&mut uxn, 0x2000);
        for i in 0..4u16 {
            assert_eq!(uxn.peek(0x3000 + i), 0xAA);
        }
        assert_eq!(uxn.peek(0x3004), 0x00);
    }

    #[test]
    fn expansion_overlapping_copies() {
        let mut uxn = Uxn::new();
        for i in 0..4u16 {
            uxn.poke(0x4000 + i, i as u8 + 1);
        }
        // cpyr: length 4, src 0x4000, dst 0x4002 (forward overlap)
        let block = [0x02, 0x00, 0x04, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x40, 0x02];
        for (i, b) in block.iter().enumerate() {
            uxn.poke(0x2000 + i as u16, *b);
        }
        expansion(&mut uxn, 0x2000);
        assert_eq!(
            [
                uxn.peek(0x4002),
                uxn.peek(0x4003),
                uxn.peek(0x4004),
                uxn.peek(0x4005)
            ],
            [1, 2, 3, 4]
        );
    }
}
