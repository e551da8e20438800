//! Datetime device: reads report the current local time, field per port.

use chrono::{Datelike, Local, Timelike};
use uxn_core::Uxn;

use crate::bus::{Device, SLOT_SIZE};

pub struct DatetimeDevice;

impl Device for DatetimeDevice {
    fn dei(&mut self, _uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8) -> u8 {
        let now = Local::now();
        match port {
            0x0 => (now.year() >> 8) as u8,
            0x1 => now.year() as u8,
            0x2 => now.month0() as u8,
            0x3 => now.day() as u8,
            0x4 => now.hour() as u8,
            0x5 => now.minute() as u8,
            0x6 => now.second() as u8,
            0x7 => now.weekday().num_days_from_sunday() as u8,
            0x8 => (now.ordinal0() >> 8) as u8,
            0x9 => now.ordinal0() as u8,
            // chrono does not expose the DST flag for local time.
            0xA => 0,
            _ => slot[usize::from(port)],
        }
    }
}
