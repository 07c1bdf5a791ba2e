//! Fixtures shared by the kernel test modules.

use aqlm_core::dequant::dequantize_weight_with_layout;
use aqlm_core::{DType, ScaleLayout, Tensor};

/// `C=2, S=256, O=1, G=8`, 64 inputs, 16 outputs, codes stored as `i8`.
///
/// Codebook 0 entry `s` is `0.25 * s` in every lane; codebook 1 entry 255 is
/// `[0, 1, ..., 7]` and every other entry is `100`. Output group `i` uses
/// entry `i` of codebook 0 and entry 255 (stored as `-1`) of codebook 1 in
/// every input group. Scales are 1 for even groups, 0.5 for odd ones.
pub fn scenario_layer(codebook_dtype: DType) -> (Tensor, Tensor, Tensor) {
    let (no, ni) = (16usize, 8usize);

    let mut cb = Vec::with_capacity(2 * 256 * 8);
    for s in 0..256 {
        cb.extend(std::iter::repeat_n(0.25 * s as f32, 8));
    }
    for s in 0..256 {
        for q in 0..8 {
            cb.push(if s == 255 { q as f32 } else { 100.0 });
        }
    }
    let codebooks = Tensor::from_f32_as(vec![2, 256, 1, 8], cb, codebook_dtype).unwrap();

    let mut codes = Vec::with_capacity(no * ni * 2);
    for i in 0..no {
        for _ in 0..ni {
            codes.push(i as i8);
            codes.push(-1i8);
        }
    }
    let codes = Tensor::from_vec(vec![no, ni, 2], codes).unwrap();

    let scales: Vec<f32> = (0..no).map(|i| if i % 2 == 0 { 1.0 } else { 0.5 }).collect();
    let scales = Tensor::from_f32_as(vec![no, 1, 1, 1], scales, codebook_dtype).unwrap();
    (codes, codebooks, scales)
}

/// Expected output of [`scenario_layer`] for an all-ones input.
pub fn scenario_expected() -> Vec<f32> {
    (0..16)
        .map(|i| {
            let scale = if i % 2 == 0 { 1.0 } else { 0.5 };
            scale * (16.0 * i as f32 + 224.0)
        })
        .collect()
}

/// `Σ_k |W[r, k] * x[k]|` for every output element, the natural scale of
/// the rounding error in a dot product.
pub fn magnitude(input: &Tensor, codes: &Tensor, codebooks: &Tensor, scales: &Tensor) -> Vec<f32> {
    magnitude_with_layout(input, codes, codebooks, scales, ScaleLayout::PerOutputGroup)
}

pub fn magnitude_with_layout(
    input: &Tensor,
    codes: &Tensor,
    codebooks: &Tensor,
    scales: &Tensor,
    scale_layout: ScaleLayout,
) -> Vec<f32> {
    let w = dequantize_weight_with_layout(codes, codebooks, scales, scale_layout).unwrap();
    let x = input.to_f32_vec().unwrap();
    let (rows, cols) = (w.rows(), w.cols());
    let n_rows = x.len() / cols;
    let mut out = Vec::with_capacity(n_rows * rows);
    for r in 0..n_rows {
        let xr = &x[r * cols..(r + 1) * cols];
        for o in 0..rows {
            out.push((0..cols).map(|k| (w.get(o, k) * xr[k]).abs()).sum());
        }
    }
    out
}

/// Assert `|got - want| <= tol * (1 + magnitude)` elementwise.
pub fn assert_close(got: &Tensor, want: &Tensor, magnitude: &[f32], tol: f32) {
    assert_eq!(got.shape(), want.shape());
    let got = got.to_f32_vec().unwrap();
    let want = want.to_f32_vec().unwrap();
    for (i, ((a, b), m)) in got.iter().zip(&want).zip(magnitude).enumerate() {
        assert!(
            (a - b).abs() <= tol * (1.0 + m),
            "element {i}: {a} vs {b} (magnitude {m}, tol {tol})"
        );
    }
}

pub fn ones(rows: usize, cols: usize, dtype: DType) -> Tensor {
    Tensor::from_f32_as(vec![rows, cols], vec![1.0; rows * cols], dtype).unwrap()
}
