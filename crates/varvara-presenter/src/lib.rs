//! GPU presentation of the emulator framebuffer.
//!
//! The framebuffer is staged through one fixed-capacity RGBA8 image; per
//! frame only the valid top-left sub-region is converted, uploaded, and
//! drawn as an aspect-corrected quad.

#![forbid(unsafe_code)]

pub mod blit;
mod presenter;

use thiserror::Error;

pub use presenter::{AspectMode, Presenter};

/// Side length of the square staging image. Frame resolutions are bounded
/// by this capacity; the screen device clamps resizes against the same
/// limit.
pub const STAGING_DIM: u32 = 1024;

#[derive(Debug, Error)]
pub enum PresenterInitError {
    #[error("no compatible gpu adapter found")]
    NoAdapter,
    #[error("gpu device request failed: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("frame size {width}x{height} exceeds staging capacity {STAGING_DIM}")]
    FrameTooLarge { width: u32, height: u32 },
    #[error("framebuffer length {actual} does not match {expected} for the frame size")]
    InvalidFramebufferLength { expected: usize, actual: usize },
    #[error("surface acquire failed: {0}")]
    SurfaceAcquire(#[from] wgpu::SurfaceError),
}
