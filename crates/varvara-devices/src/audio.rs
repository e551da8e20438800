//! Audio slots are mounted but not synthesized. Reads are deterministic
//! zeros, traffic is logged so guest use stays visible.

use tracing::debug;
use uxn_core::Uxn;

use crate::bus::{Device, SLOT_SIZE};

pub struct AudioStub {
    slot: u8,
}

impl AudioStub {
    pub fn new(slot: u8) -> Self {
        Self { slot }
    }
}

impl Device for AudioStub {
    fn dei(&mut self, _uxn: &mut Uxn, _slot: &mut [u8; SLOT_SIZE], port: u8) -> u8 {
        debug!(slot = self.slot, port, "audio read ignored");
        0
    }

    fn deo(&mut self, _uxn: &mut Uxn, _slot: &mut [u8; SLOT_SIZE], port: u8, value: u8) {
        debug!(slot = self.slot, port, value, "audio write ignored");
    }
}
