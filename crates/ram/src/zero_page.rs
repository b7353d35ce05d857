//! Zero-page detection
//!
//! Decides whether a page is entirely zero so the saver can record it in the
//! index instead of writing it out.
//!
//! On x86_64 the check runs on SSE2 (always present on that target): the
//! buffer is walked in 64-byte strides, four 16-byte lanes are OR-reduced and
//! the result compared against the zero vector. Buffers that are not
//! 16-byte aligned or not a multiple of 64 bytes fall back to the scalar
//! path, which walks 8-byte words and stops at the first non-zero one. Both
//! paths return the same answer for every input.

/// Stride of the vectorized scan
pub const SIMD_STRIDE: usize = 64;

/// Check whether every byte of `buf` is zero
pub fn is_buffer_zeroed(buf: &[u8]) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(zero) = is_buffer_zeroed_simd(buf) {
            return zero;
        }
    }
    is_buffer_zeroed_scalar(buf)
}

/// Portable implementation
pub fn is_buffer_zeroed_scalar(buf: &[u8]) -> bool {
    let words = buf.chunks_exact(8);
    let tail = words.remainder();
    words
        .map(|w| u64::from_ne_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]))
        .all(|w| w == 0)
        && tail.iter().all(|b| *b == 0)
}

/// Vectorized implementation
///
/// Returns `None` when `buf` does not meet the alignment and length
/// requirements of the vector path.
#[cfg(target_arch = "x86_64")]
pub fn is_buffer_zeroed_simd(buf: &[u8]) -> Option<bool> {
    if buf.is_empty() || buf.len() % SIMD_STRIDE != 0 || buf.as_ptr() as usize % 16 != 0 {
        return None;
    }
    // SAFETY: SSE2 is part of the x86_64 baseline; alignment and length were
    // checked above.
    Some(unsafe { sse2::is_zeroed(buf) })
}

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use std::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_load_si128, _mm_movemask_epi8, _mm_or_si128, _mm_prefetch,
        _mm_setzero_si128, _MM_HINT_T0,
    };

    /// Lanes fetched ahead of the current stride
    const PREFETCH_LANES: usize = 16;

    /// # Safety
    ///
    /// `buf` must be 16-byte aligned and its length a non-zero multiple of 64.
    #[target_feature(enable = "sse2")]
    pub(super) unsafe fn is_zeroed(buf: &[u8]) -> bool {
        let zero = _mm_setzero_si128();
        let lanes = buf.len() / 16;
        let base = buf.as_ptr() as *const __m128i;
        let mut i = 0;
        while i < lanes {
            // Prefetch never faults, so running past the end is harmless.
            _mm_prefetch::<_MM_HINT_T0>(base.wrapping_add(i + PREFETCH_LANES) as *const i8);
            let a = _mm_load_si128(base.add(i));
            let b = _mm_load_si128(base.add(i + 1));
            let c = _mm_load_si128(base.add(i + 2));
            let d = _mm_load_si128(base.add(i + 3));
            let t = _mm_or_si128(_mm_or_si128(a, b), _mm_or_si128(c, d));
            if _mm_movemask_epi8(_mm_cmpeq_epi8(t, zero)) != 0xFFFF {
                return false;
            }
            i += 4;
        }
        true
    }
}
