//! Varvara device models and the port bus that mounts them.

#![forbid(unsafe_code)]

mod audio;
mod bus;
mod console;
mod datetime;
mod file;
mod screen;
mod system;

pub use bus::{Device, PendingInput, Registers, VarvaraBus, SLOT_COUNT, SLOT_SIZE};
pub use file::FileDevice;
pub use screen::{Screen, SharedScreen, MAX_DIM};
