//! Reference path: expand codes + codebooks into a dense weight matrix, then
//! multiply densely.
//!
//! This is the ground truth the fused kernels are checked against, so its
//! summation order is fixed and machine-independent:
//! - codebooks are summed in ascending order starting from `0.0`,
//! - the sum is multiplied by the group's scale,
//! - the dense product accumulates each row with [`scalar::dot`] (ascending
//!   input index, one accumulator), and bias is added last.

use crate::codes::Codes;
use crate::error::Result;
use crate::layout::{QuantShape, ScaleLayout};
use crate::simd::scalar;
use crate::tensor::{Tensor, try_filled};

/// Dense `[out_features, in_features]` weight in `f32`, row-major.
#[derive(Debug, Clone)]
pub struct DenseWeight {
    pub shape: QuantShape,
    pub data: Vec<f32>,
}

impl DenseWeight {
    pub fn rows(&self) -> usize {
        self.shape.out_features()
    }

    pub fn cols(&self) -> usize {
        self.shape.in_features()
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols() + col]
    }
}

/// Materialize `W[o*O + p, j*G + g] = scale * Σ_c codebook[c, code[o, j, c], p, g]`
/// for a forward layer with `scales [num_out_groups, 1, 1, 1]`.
pub fn dequantize_weight(codes: &Tensor, codebooks: &Tensor, scales: &Tensor) -> Result<DenseWeight> {
    dequantize_weight_with_layout(codes, codebooks, scales, ScaleLayout::PerOutputGroup)
}

pub fn dequantize_weight_with_layout(
    codes: &Tensor,
    codebooks: &Tensor,
    scales: &Tensor,
    scale_layout: ScaleLayout,
) -> Result<DenseWeight> {
    let shape = QuantShape::infer(codes, codebooks, scales, scale_layout)?;
    let codes = Codes::new(codes, shape.codebook_size)?;
    codes.validate()?;

    let table = codebooks.to_f32_vec()?;
    let scales = scales.to_f32_vec()?;

    let QuantShape {
        num_codebooks: c_count,
        codebook_size: s,
        out_group_size: o,
        in_group_size: g,
        num_out_groups,
        num_in_groups,
        ..
    } = shape;
    let cols = shape.in_features();
    let entry = o * g;

    let mut data = try_filled(shape.out_features() * cols, 0.0f32)?;
    let mut idx = vec![0u32; c_count];

    for og in 0..num_out_groups {
        for ig in 0..num_in_groups {
            codes.decode_into((og * num_in_groups + ig) * c_count, &mut idx);
            let scale = match scale_layout {
                ScaleLayout::PerOutputGroup => scales[og],
                ScaleLayout::PerInputGroup => scales[ig],
            };
            for p in 0..o {
                for q in 0..g {
                    let mut w = 0.0f32;
                    for (c, &code) in idx.iter().enumerate() {
                        w += table[(c * s + code as usize) * entry + p * g + q];
                    }
                    data[(og * o + p) * cols + ig * g + q] = w * scale;
                }
            }
        }
    }

    Ok(DenseWeight { shape, data })
}

/// `out[r] = Σ_k weight[r, k] * x[k]` with the canonical accumulation order.
pub fn dense_gemv(weight: &DenseWeight, x: &[f32], out: &mut [f32]) {
    let cols = weight.cols();
    for (r, y) in out.iter_mut().enumerate().take(weight.rows()) {
        *y = scalar::dot(&weight.data[r * cols..(r + 1) * cols], x);
    }
}

/// Full reference path: dequantize once, then one dense product per input
/// row. Output keeps the input's dtype.
pub fn dequantize_gemm(
    input: &Tensor,
    codes: &Tensor,
    codebooks: &Tensor,
    scales: &Tensor,
    bias: Option<&Tensor>,
) -> Result<Tensor> {
    dequantize_gemm_with_layout(input, codes, codebooks, scales, ScaleLayout::PerOutputGroup, bias)
}

pub fn dequantize_gemm_with_layout(
    input: &Tensor,
    codes: &Tensor,
    codebooks: &Tensor,
    scales: &Tensor,
    scale_layout: ScaleLayout,
    bias: Option<&Tensor>,
) -> Result<Tensor> {
    let shape = QuantShape::infer(codes, codebooks, scales, scale_layout)?;
    let rows = shape.check_input(input)?;
    shape.check_bias(bias)?;

    let weight = dequantize_weight_with_layout(codes, codebooks, scales, scale_layout)?;
    let x = input.to_f32_vec()?;
    let bias = bias.map(|b| b.to_f32_vec()).transpose()?;

    let (n_in, n_out) = (shape.in_features(), shape.out_features());
    let mut out = try_filled(rows * n_out, 0.0f32)?;
    for r in 0..rows {
        let y = &mut out[r * n_out..(r + 1) * n_out];
        dense_gemv(&weight, &x[r * n_in..(r + 1) * n_in], y);
        if let Some(b) = &bias {
            for (v, bv) in y.iter_mut().zip(b) {
                *v += bv;
            }
        }
    }

    Tensor::from_f32_as(shape.output_shape(input), out, input.dtype())
}
