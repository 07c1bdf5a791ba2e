//! Host dot-product dispatch. The SIMD level is probed once and cached.

pub mod scalar;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod avx2;

use std::sync::atomic::{AtomicU8, Ordering::Relaxed};

static LEVEL: AtomicU8 = AtomicU8::new(0);

const SCALAR: u8 = 1;
const AVX2: u8 = 2;

fn dispatch_level() -> u8 {
    let l = LEVEL.load(Relaxed);
    if l != 0 {
        return l;
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    let detected = if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        AVX2
    } else {
        SCALAR
    };

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let detected = SCALAR;

    tracing::debug!(level = level_name_of(detected), "host simd level detected");
    LEVEL.store(detected, Relaxed);
    detected
}

fn level_name_of(level: u8) -> &'static str {
    match level {
        AVX2 => "avx2+fma",
        _ => "scalar",
    }
}

/// Name of the instruction set the host kernels run on.
pub fn level_name() -> &'static str {
    level_name_of(dispatch_level())
}

/// `f32` dot product over `min(a.len(), b.len())` elements.
///
/// Accumulation order depends on the detected level, so callers that need
/// machine-independent results use [`scalar::dot`] directly.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if dispatch_level() == AVX2 {
        // SAFETY: avx2 and fma were detected at runtime.
        return unsafe { avx2::dot(a, b) };
    }

    scalar::dot(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_matches_scalar() {
        for n in [0usize, 1, 7, 8, 9, 16, 33, 100] {
            let a: Vec<f32> = (0..n).map(|i| (i as f32) * 0.25 - 3.0).collect();
            let b: Vec<f32> = (0..n).map(|i| 1.0 - (i as f32) * 0.125).collect();
            let want = scalar::dot(&a, &b);
            let got = dot(&a, &b);
            assert!((want - got).abs() <= 1e-4 * want.abs().max(1.0), "n={n}");
        }
    }

    #[test]
    fn test_level_is_cached() {
        let first = level_name();
        assert_eq!(first, level_name());
        assert_ne!(LEVEL.load(Relaxed), 0);
    }
}
