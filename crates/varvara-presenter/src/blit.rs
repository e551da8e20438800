//! CPU-side channel conversion into the staging buffer.

use crate::STAGING_DIM;

/// Byte stride of one staging row.
pub const STAGING_STRIDE: usize = STAGING_DIM as usize * 4;

/// Converts the `width x height` BGRA framebuffer into the top-left region
/// of the RGBA staging buffer.
///
/// The destination stride is the fixed staging width regardless of the
/// current resolution; bytes beyond `width` in each row and rows beyond
/// `height` are left untouched. Alpha passes through.
pub fn blit_bgra(src: &[u8], width: u32, height: u32, dst: &mut [u8]) {
    let w = width as usize;
    let h = height as usize;
    debug_assert!(src.len() >= w * h * 4);
    debug_assert!(dst.len() >= h.saturating_sub(1) * STAGING_STRIDE + w * 4);
    for y in 0..h {
        let src_row = &src[y * w * 4..(y + 1) * w * 4];
        let dst_row = &mut dst[y * STAGING_STRIDE..y * STAGING_STRIDE + w * 4];
        for (s, d) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(4)) {
            d[0] = s[2];
            d[1] = s[1];
            d[2] = s[0];
            d[3] = s[3];
        }
    }
}
