//! Uxn byte-code stack machine.
//!
//! This crate is the instruction-execution core only: 64 KiB of RAM, two
//! 256-byte circular stacks, and the 32 base opcodes with their short /
//! return / keep mode variants. All interaction with the outside world goes
//! through the [`DeviceBus`] trait, which a host implements to back the
//! `DEI`/`DEO` instructions with device models.
//!
//! [`Uxn::eval`] runs a vector until `BRK`. Evaluation itself cannot fail
//! (stack pointers wrap and division by zero yields zero), but a caller may
//! supply a step budget so a runaway vector surfaces as a typed [`Fault`]
//! instead of hanging the host.

#![forbid(unsafe_code)]

mod stack;
pub use stack::UxnStack;

use thiserror::Error;

pub const RAM_SIZE: usize = 0x1_0000;

/// Fixed load address for boot ROMs; the zero page below it belongs to the
/// program as scratch storage.
pub const PAGE_PROGRAM: u16 = 0x0100;

/// Port access callbacks invoked by the `DEI` and `DEO` instructions.
///
/// Handlers receive the full machine state because several devices reach
/// back into RAM (sprite data, file names) or the stacks (system device
/// introspection registers).
pub trait DeviceBus {
    fn dei(&mut self, uxn: &mut Uxn, address: u8) -> u8;
    fn deo(&mut self, uxn: &mut Uxn, address: u8, value: u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("step budget exhausted while evaluating vector {entry:#06x}")]
    BudgetExhausted { entry: u16 },
}

pub struct Uxn {
    pub ram: Box<[u8; RAM_SIZE]>,
    pub wst: UxnStack,
    pub rst: UxnStack,
}

impl Uxn {
    pub fn new() -> Self {
        Self {
            ram: Box::new([0; RAM_SIZE]),
            wst: UxnStack::new(),
            rst: UxnStack::new(),
        }
    }

    /// Copies a boot ROM into RAM at [`PAGE_PROGRAM`], truncating at the end
    /// of RAM. Returns the number of bytes actually loaded.
    pub fn load_rom(&mut self, rom: &[u8]) -> usize {
        let capacity = RAM_SIZE - PAGE_PROGRAM as usize;
        let len = rom.len().min(capacity);
        self.ram[PAGE_PROGRAM as usize..PAGE_PROGRAM as usize + len]
            .copy_from_slice(&rom[..len]);
        len
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.ram[addr as usize]
    }

    /// Reads a big-endian short, wrapping at the end of RAM.
    pub fn peek2(&self, addr: u16) -> u16 {
        u16::from_be_bytes([self.peek(addr), self.peek(addr.wrapping_add(1))])
    }

    pub fn poke(&mut self, addr: u16, value: u8) {
        self.ram[addr as usize] = value;
    }

    pub fn poke2(&mut self, addr: u16, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.poke(addr, hi);
        self.poke(addr.wrapping_add(1), lo);
    }

    fn pop(&mut self, r: bool) -> u8 {
        if r {
            self.rst.pop()
        } else {
            self.wst.pop()
        }
    }

    fn pop2(&mut self, r: bool) -> u16 {
        if r {
            self.rst.pop2()
        } else {
            self.wst.pop2()
        }
    }

    fn push(&mut self, r: bool, value: u8) {
        if r {
            self.rst.push(value)
        } else {
            self.wst.push(value)
        }
    }

    fn push2(&mut self, r: bool, value: u16) {
        if r {
            self.rst.push2(value)
        } else {
            self.wst.push2(value)
        }
    }

    /// Pushes onto the stack *opposite* to the current mode stack (used by
    /// `JSR` return addresses and `STH`).
    fn push_other(&mut self, r: bool, value: u8) {
        if r {
            self.wst.push(value)
        } else {
            self.rst.push(value)
        }
    }

    fn push2_other(&mut self, r: bool, value: u16) {
        if r {
            self.wst.push2(value)
        } else {
            self.rst.push2(value)
        }
    }

    fn stack_ptr(&self, r: bool) -> u8 {
        if r {
            self.rst.ptr()
        } else {
            self.wst.ptr()
        }
    }

    /// Keep mode: operands are read destructively, then the source stack
    /// pointer is rewound to its pre-instruction value before results are
    /// pushed.
    fn rewind(&mut self, r: bool, keep: bool, saved: u8) {
        if keep {
            if r {
                self.rst.set_ptr(saved);
            } else {
                self.wst.set_ptr(saved);
            }
        }
    }

    /// Runs the vector at `entry` until `BRK`.
    ///
    /// Returns `Ok(false)` without executing anything when `entry` is zero
    /// (the convention for "no vector installed"). A non-zero `budget` bounds
    /// the number of instructions executed; exceeding it is a
    /// [`Fault::BudgetExhausted`]. A budget of zero means unbounded.
    pub fn eval<B: DeviceBus>(&mut self, bus: &mut B, entry: u16, budget: u64) -> Result<bool, Fault> {
        if entry == 0 {
            return Ok(false);
        }
        let mut pc = entry;
        let mut steps: u64 = 0;
        loop {
            if budget != 0 {
                steps += 1;
                if steps > budget {
                    return Err(Fault::BudgetExhausted { entry });
                }
            }
            let ins = self.peek(pc);
            pc = pc.wrapping_add(1);
            match ins {
                // BRK
                0x00 => return Ok(true),
                // JCI: conditional relative jump, 16-bit signed operand.
                0x20 => {
                    let cond = self.wst.pop();
                    let off = self.peek2(pc);
                    pc = pc.wrapping_add(2);
                    if cond != 0 {
                        pc = pc.wrapping_add(off);
                    }
                }
                // JMI
                0x40 => {
                    let off = self.peek2(pc);
                    pc = pc.wrapping_add(2).wrapping_add(off);
                }
                // JSI
                0x60 => {
                    let off = self.peek2(pc);
                    let ret = pc.wrapping_add(2);
                    self.rst.push2(ret);
                    pc = ret.wrapping_add(off);
                }
                // LIT / LITr
                0x80 | 0xC0 => {
                    let v = self.peek(pc);
                    pc = pc.wrapping_add(1);
                    self.push(ins == 0xC0, v);
                }
                // LIT2 / LIT2r
                0xA0 | 0xE0 => {
                    let v = self.peek2(pc);
                    pc = pc.wrapping_add(2);
                    self.push2(ins == 0xE0, v);
                }
                _ => {
                    let s = ins & 0x20 != 0;
                    let r = ins & 0x40 != 0;
                    let k = ins & 0x80 != 0;
                    let saved = self.stack_ptr(r);
                    pc = self.step(bus, ins & 0x1F, pc, s, r, k, saved);
                }
            }
        }
    }

    /// Executes one non-immediate opcode; `pc` is the address directly after
    /// the instruction byte, and the return value is the next `pc`.
    #[allow(clippy::too_many_arguments)]
    fn step<B: DeviceBus>(
        &mut self,
        bus: &mut B,
        op: u8,
        pc: u16,
        s: bool,
        r: bool,
        k: bool,
        saved: u8,
    ) -> u16 {
        match op {
            // INC
            0x01 => {
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, v.wrapping_add(1));
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, v.wrapping_add(1));
                }
            }
            // POP
            0x02 => {
                if s {
                    self.pop2(r);
                } else {
                    self.pop(r);
                }
                self.rewind(r, k, saved);
            }
            // NIP
            0x03 => {
                if s {
                    let b = self.pop2(r);
                    let _ = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, b);
                } else {
                    let b = self.pop(r);
                    let _ = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, b);
                }
            }
            // SWP
            0x04 => {
                if s {
                    let b = self.pop2(r);
                    let a = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, b);
                    self.push2(r, a);
                } else {
                    let b = self.pop(r);
                    let a = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, b);
                    self.push(r, a);
                }
            }
            // ROT
            0x05 => {
                if s {
                    let c = self.pop2(r);
                    let b = self.pop2(r);
                    let a = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, b);
                    self.push2(r, c);
                    self.push2(r, a);
                } else {
                    let c = self.pop(r);
                    let b = self.pop(r);
                    let a = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, b);
                    self.push(r, c);
                    self.push(r, a);
                }
            }
            // DUP
            0x06 => {
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, v);
                    self.push2(r, v);
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, v);
                    self.push(r, v);
                }
            }
            // OVR
            0x07 => {
                if s {
                    let b = self.pop2(r);
                    let a = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, a);
                    self.push2(r, b);
                    self.push2(r, a);
                } else {
                    let b = self.pop(r);
                    let a = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, a);
                    self.push(r, b);
                    self.push(r, a);
                }
            }
            // EQU / NEQ / GTH / LTH push a byte flag in all modes.
            0x08..=0x0B => {
                let (a, b) = if s {
                    let b = self.pop2(r);
                    let a = self.pop2(r);
                    (a, b)
                } else {
                    let b = u16::from(self.pop(r));
                    let a = u16::from(self.pop(r));
                    (a, b)
                };
                self.rewind(r, k, saved);
                let flag = match op {
                    0x08 => a == b,
                    0x09 => a != b,
                    0x0A => a > b,
                    _ => a < b,
                };
                self.push(r, flag as u8);
            }
            // JMP
            0x0C => {
                if s {
                    let t = self.pop2(r);
                    self.rewind(r, k, saved);
                    return t;
                }
                let d = self.pop(r) as i8;
                self.rewind(r, k, saved);
                return pc.wrapping_add(d as u16);
            }
            // JCN
            0x0D => {
                if s {
                    let t = self.pop2(r);
                    let cond = self.pop(r);
                    self.rewind(r, k, saved);
                    if cond != 0 {
                        return t;
                    }
                } else {
                    let d = self.pop(r) as i8;
                    let cond = self.pop(r);
                    self.rewind(r, k, saved);
                    if cond != 0 {
                        return pc.wrapping_add(d as u16);
                    }
                }
            }
            // JSR
            0x0E => {
                let target = if s {
                    let t = self.pop2(r);
                    self.rewind(r, k, saved);
                    t
                } else {
                    let d = self.pop(r) as i8;
                    self.rewind(r, k, saved);
                    pc.wrapping_add(d as u16)
                };
                self.push2_other(r, pc);
                return target;
            }
            // STH
            0x0F => {
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2_other(r, v);
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push_other(r, v);
                }
            }
            // LDZ
            0x10 => {
                let addr = u16::from(self.pop(r));
                self.rewind(r, k, saved);
                if s {
                    let v = self.peek2(addr);
                    self.push2(r, v);
                } else {
                    let v = self.peek(addr);
                    self.push(r, v);
                }
            }
            // STZ
            0x11 => {
                let addr = u16::from(self.pop(r));
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.poke2(addr, v);
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    self.poke(addr, v);
                }
            }
            // LDR
            0x12 => {
                let d = self.pop(r) as i8;
                self.rewind(r, k, saved);
                let addr = pc.wrapping_add(d as u16);
                if s {
                    let v = self.peek2(addr);
                    self.push2(r, v);
                } else {
                    let v = self.peek(addr);
                    self.push(r, v);
                }
            }
            // STR
            0x13 => {
                let d = self.pop(r) as i8;
                let addr = pc.wrapping_add(d as u16);
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.poke2(addr, v);
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    self.poke(addr, v);
                }
            }
            // LDA
            0x14 => {
                let addr = self.pop2(r);
                self.rewind(r, k, saved);
                if s {
                    let v = self.peek2(addr);
                    self.push2(r, v);
                } else {
                    let v = self.peek(addr);
                    self.push(r, v);
                }
            }
            // STA
            0x15 => {
                let addr = self.pop2(r);
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.poke2(addr, v);
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    self.poke(addr, v);
                }
            }
            // DEI
            0x16 => {
                let addr = self.pop(r);
                self.rewind(r, k, saved);
                if s {
                    let hi = bus.dei(self, addr);
                    let lo = bus.dei(self, addr.wrapping_add(1));
                    self.push2(r, u16::from_be_bytes([hi, lo]));
                } else {
                    let v = bus.dei(self, addr);
                    self.push(r, v);
                }
            }
            // DEO
            0x17 => {
                let addr = self.pop(r);
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    let [hi, lo] = v.to_be_bytes();
                    bus.deo(self, addr, hi);
                    bus.deo(self, addr.wrapping_add(1), lo);
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    bus.deo(self, addr, v);
                }
            }
            // ADD / SUB / MUL / DIV / AND / ORA / EOR
            0x18..=0x1E => {
                if s {
                    let b = self.pop2(r);
                    let a = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, arith16(op, a, b));
                } else {
                    let b = self.pop(r);
                    let a = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, arith8(op, a, b));
                }
            }
            // SFT: the shift byte packs a right shift in the low nibble and
            // a left shift in the high nibble.
            0x1F => {
                let shift = self.pop(r);
                let right = shift & 0x0F;
                let left = shift >> 4;
                if s {
                    let v = self.pop2(r);
                    self.rewind(r, k, saved);
                    self.push2(r, (v >> right) << left);
                } else {
                    let v = self.pop(r);
                    self.rewind(r, k, saved);
                    self.push(r, (v >> right) << left);
                }
            }
            _ => unreachable!("opcode is masked to five bits"),
        }
        pc
    }
}

impl Default for Uxn {
    fn default() -> Self {
        Self::new()
    }
}

fn arith8(op: u8, a: u8, b: u8) -> u8 {
    match op {
        0x18 => a.wrapping_add(b),
        0x19 => a.wrapping_sub(b),
        0x1A => a.wrapping_mul(b),
        0x1B => {
            if b == 0 {
                0
            } else {
                a / b
            }
        }
        0x1C => a & b,
        0x1D => a | b,
        _ => a ^ b,
    }
}

fn arith16(op: u8, a: u16, b: u16) -> u16 {
    match op {
        0x18 => a.wrapping_add(b),
        0x19 => a.wrapping_sub(b),
        0x1A => a.wrapping_mul(b),
        0x1B => {
            if b == 0 {
                0
            } else {
                a / b
            }
        }
        0x1C => a & b,
        0x1D => a | b,
        _ => a ^ b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records DEO traffic and answers DEI from a flat byte map.
    struct CaptureBus {
        regs: [u8; 0x100],
        writes: Vec<(u8, u8)>,
    }

    impl Default for CaptureBus {
        fn default() -> Self {
            Self {
                regs: [0; 0x100],
                writes: Vec::new(),
            }
        }
    }

    impl DeviceBus for CaptureBus {
        fn dei(&mut self, _uxn: &mut Uxn, address: u8) -> u8 {
            self.regs[address as usize]
        }

        fn deo(&mut self, _uxn: &mut Uxn, address: u8, value: u8) {
            self.regs[address as usize] = value;
            self.writes.push((address, value));
        }
    }

    fn run(rom: &[u8]) -> (Uxn, CaptureBus) {
        let mut uxn = Uxn::new();
        let mut bus = CaptureBus::default();
        uxn.load_rom(rom);
        uxn.eval(&mut bus, PAGE_PROGRAM, 0x10000).unwrap();
        (uxn, bus)
    }

    #[test]
    fn zero_entry_runs_nothing() {
        let mut uxn = Uxn::new();
        let mut bus = CaptureBus::default();
        assert_eq!(uxn.eval(&mut bus, 0, 0), Ok(false));
    }

    #[test]
    fn literals_and_arithmetic() {
        // LIT 12 LIT 34 ADD BRK
        let (uxn, _) = run(&[0x80, 0x12, 0x80, 0x34, 0x18, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x46]);

        // LIT2 0102 LIT2 0304 ADD2 BRK
        let (uxn, _) = run(&[0xA0, 0x01, 0x02, 0xA0, 0x03, 0x04, 0x38, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x04, 0x06]);
    }

    #[test]
    fn subtraction_order_and_div_by_zero() {
        // LIT 05 LIT 03 SUB BRK -> 2
        let (uxn, _) = run(&[0x80, 0x05, 0x80, 0x03, 0x19, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x02]);

        // LIT 05 LIT 00 DIV BRK -> 0
        let (uxn, _) = run(&[0x80, 0x05, 0x80, 0x00, 0x1B, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x00]);
    }

    #[test]
    fn keep_mode_preserves_operands() {
        // LIT 02 LIT 03 ADDk BRK -> 02 03 05
        let (uxn, _) = run(&[0x80, 0x02, 0x80, 0x03, 0x98, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x02, 0x03, 0x05]);
    }

    #[test]
    fn stack_shuffles() {
        // LIT 01 LIT 02 SWP BRK
        let (uxn, _) = run(&[0x80, 0x01, 0x80, 0x02, 0x04, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x02, 0x01]);

        // LIT 01 LIT 02 LIT 03 ROT BRK -> 02 03 01
        let (uxn, _) = run(&[0x80, 0x01, 0x80, 0x02, 0x80, 0x03, 0x05, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x02, 0x03, 0x01]);

        // LIT 01 LIT 02 OVR BRK -> 01 02 01
        let (uxn, _) = run(&[0x80, 0x01, 0x80, 0x02, 0x07, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x01, 0x02, 0x01]);
    }

    #[test]
    fn comparisons_push_byte_flags() {
        // LIT2 0001 LIT2 0002 LTH2 BRK -> 01
        let (uxn, _) = run(&[0xA0, 0x00, 0x01, 0xA0, 0x00, 0x02, 0x2B, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x01]);

        // LIT 09 LIT 04 GTH BRK -> 01
        let (uxn, _) = run(&[0x80, 0x09, 0x80, 0x04, 0x0A, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x01]);
    }

    #[test]
    fn zero_page_store_and_load() {
        // LIT 5A LIT 10 STZ LIT 10 LDZ BRK
        let (uxn, _) = run(&[0x80, 0x5A, 0x80, 0x10, 0x11, 0x80, 0x10, 0x10, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x5A]);
        assert_eq!(uxn.peek(0x0010), 0x5A);
    }

    #[test]
    fn absolute_store_and_load() {
        // LIT 77 LIT2 8000 STA LIT2 8000 LDA BRK
        let (uxn, _) = run(&[
            0x80, 0x77, 0xA0, 0x80, 0x00, 0x15, 0xA0, 0x80, 0x00, 0x14, 0x00,
        ]);
        assert_eq!(uxn.wst.used(), &[0x77]);
        assert_eq!(uxn.peek(0x8000), 0x77);
    }

    #[test]
    fn subroutine_call_and_return() {
        // JSI +1 BRK ; sub: LIT 42 JMP2r
        // 0100: 60 00 01   call 0x0104
        // 0103: 00         BRK
        // 0104: 80 42      LIT 42
        // 0106: 6c         JMP2r
        let (uxn, _) = run(&[0x60, 0x00, 0x01, 0x00, 0x80, 0x42, 0x6C]);
        assert_eq!(uxn.wst.used(), &[0x42]);
        assert_eq!(uxn.rst.ptr(), 0);
    }

    #[test]
    fn conditional_immediate_jump() {
        // LIT 01 JCI +1 (skip LIT ee) LIT 42 BRK
        // 0100: 80 01      LIT 01
        // 0102: 20 00 02   JCI +2 -> 0x0107
        // 0105: 80 EE      LIT EE   (skipped)
        // 0107: 80 42      LIT 42
        // 0109: 00         BRK
        let (uxn, _) = run(&[0x80, 0x01, 0x20, 0x00, 0x02, 0x80, 0xEE, 0x80, 0x42, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x42]);

        // Same program with a zero condition takes the fall-through path.
        let (uxn, _) = run(&[0x80, 0x00, 0x20, 0x00, 0x02, 0x80, 0xEE, 0x80, 0x42, 0x00]);
        assert_eq!(uxn.wst.used(), &[0xEE, 0x42]);
    }

    #[test]
    fn device_write_and_read() {
        // LIT AB LIT 18 DEO LIT 18 DEI BRK
        let (uxn, bus) = run(&[0x80, 0xAB, 0x80, 0x18, 0x17, 0x80, 0x18, 0x16, 0x00]);
        assert_eq!(bus.writes, vec![(0x18, 0xAB)]);
        assert_eq!(uxn.wst.used(), &[0xAB]);
    }

    #[test]
    fn short_device_write_hits_both_ports() {
        // LIT2 1234 LIT 20 DEO2 BRK
        let (_, bus) = run(&[0xA0, 0x12, 0x34, 0x80, 0x20, 0x37, 0x00]);
        assert_eq!(bus.writes, vec![(0x20, 0x12), (0x21, 0x34)]);
    }

    #[test]
    fn shift_packs_both_directions() {
        // LIT 34 LIT 14 SFT BRK -> (0x34 >> 4) << 1 = 0x06
        let (uxn, _) = run(&[0x80, 0x34, 0x80, 0x14, 0x1F, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x06]);
    }

    #[test]
    fn runaway_vector_hits_budget() {
        // JMI -3: jumps back to itself forever.
        let mut uxn = Uxn::new();
        let mut bus = CaptureBus::default();
        uxn.load_rom(&[0x40, 0xFF, 0xFD]);
        assert_eq!(
            uxn.eval(&mut bus, PAGE_PROGRAM, 100),
            Err(Fault::BudgetExhausted {
                entry: PAGE_PROGRAM
            })
        );
    }

    #[test]
    fn return_mode_uses_return_stack() {
        // LITr 05 LITr 03 ADDr STHr BRK -> wst [08]
        let (uxn, _) = run(&[0xC0, 0x05, 0xC0, 0x03, 0x58, 0x4F, 0x00]);
        assert_eq!(uxn.wst.used(), &[0x08]);
        assert_eq!(uxn.rst.ptr(), 0);
    }
}
