//! Console device: byte-at-a-time stdout/stderr output. Host input lands in
//! the input register via the bus push method and runs the console vector.

use std::io::Write;

use uxn_core::Uxn;

use crate::bus::{Device, SLOT_SIZE};

pub struct ConsoleDevice;

impl Device for ConsoleDevice {
    fn deo(&mut self, _uxn: &mut Uxn, _slot: &mut [u8; SLOT_SIZE], port: u8, value: u8) {
        match port {
            0x8 => write_byte(std::io::stdout(), value),
            0x9 => write_byte(std::io::stderr(), value),
            _ => {}
        }
    }
}

fn write_byte(mut out: impl Write, byte: u8) {
    // Output failure must not surface through the bus.
    if out.write_all(&[byte]).and_then(|_| out.flush()).is_err() {
        tracing::trace!(byte, "console write dropped");
    }
}
