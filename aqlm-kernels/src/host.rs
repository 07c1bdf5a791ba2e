//! Host kernel for `O = 1` layers: per-row lookup table of codebook-entry
//! dot products, then one table read per code.
//!
//! For 256-entry codebooks the table for one row is `num_in_groups * C * 256`
//! floats, small enough to stay cache resident while every output group
//! sums its `num_in_groups * C` entries.

use crate::GemvBackend;
use aqlm_core::codes::Codes;
use aqlm_core::tensor::try_filled;
use aqlm_core::{AqlmError, QuantShape, Result, ScaleLayout, Tensor, simd};
use rayon::prelude::*;

#[derive(Debug, Default)]
pub struct HostLutGemv;

impl HostLutGemv {
    pub fn new() -> Self {
        Self
    }
}

/// `lut[(j * C + c) * S + s] = dot(codebook[c, s, 0, :], x[j])`, with the
/// input group's scale folded in for role-swapped layers.
fn build_lut(shape: &QuantShape, table: &[f32], scales: &[f32], x: &[f32], lut: &mut [f32]) {
    let (nc, s, g) = (shape.num_codebooks, shape.codebook_size, shape.in_group_size);
    lut.par_chunks_mut(nc * s).enumerate().for_each(|(j, group)| {
        let xj = &x[j * g..(j + 1) * g];
        let scale = match shape.scale_layout {
            ScaleLayout::PerInputGroup => scales[j],
            ScaleLayout::PerOutputGroup => 1.0,
        };
        for (entry, v) in group.iter_mut().enumerate() {
            *v = simd::dot(&table[entry * g..(entry + 1) * g], xj) * scale;
        }
    });
}

impl GemvBackend for HostLutGemv {
    fn name(&self) -> &str {
        "host-lut"
    }

    fn apply_with_layout(
        &self,
        input: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        scale_layout: ScaleLayout,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let shape = QuantShape::infer(codes, codebooks, scales, scale_layout)?;
        if shape.out_group_size != 1 {
            return Err(AqlmError::config(format!(
                "host lookup kernel requires out_group_size 1, got {}",
                shape.out_group_size
            )));
        }
        let rows = shape.check_input(input)?;
        shape.check_bias(bias)?;
        let codes = Codes::new(codes, shape.codebook_size)?;
        codes.validate()?;

        let table = codebooks.to_f32_vec()?;
        let scales = scales.to_f32_vec()?;
        let x = input.to_f32_vec()?;
        let bias = bias.map(Tensor::to_f32_vec).transpose()?;

        let (nc, s, ni) = (shape.num_codebooks, shape.codebook_size, shape.num_in_groups);
        let (n_in, n_out) = (shape.in_features(), shape.out_features());
        let mut lut = try_filled(ni * nc * s, 0.0f32)?;
        let mut out = try_filled(rows * n_out, 0.0f32)?;

        for r in 0..rows {
            build_lut(&shape, &table, &scales, &x[r * n_in..(r + 1) * n_in], &mut lut);

            let y = &mut out[r * n_out..(r + 1) * n_out];
            y.par_iter_mut().enumerate().for_each_init(
                || vec![0u32; ni * nc],
                |idx, (i, yi)| {
                    codes.decode_into(i * ni * nc, idx);
                    let mut acc = 0.0f32;
                    for (k, &code) in idx.iter().enumerate() {
                        acc += lut[k * s + code as usize];
                    }
                    *yi = match shape.scale_layout {
                        ScaleLayout::PerOutputGroup => acc * scales[i],
                        ScaleLayout::PerInputGroup => acc,
                    };
                },
            );

            if let Some(b) = &bias {
                for (v, bv) in y.iter_mut().zip(b) {
                    *v += bv;
                }
            }
        }

        Tensor::from_f32_as(shape.output_shape(input), out, input.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        assert_close, magnitude, magnitude_with_layout, ones, scenario_expected, scenario_layer,
    };
    use aqlm_core::dequant::{dequantize_gemm, dequantize_gemm_with_layout};
    use aqlm_core::synth::{LayerSpec, QuantizedLayer, random_input};
    use aqlm_core::{DType, ErrorKind};

    #[test]
    fn test_scenario_known_values() {
        let (codes, codebooks, scales) = scenario_layer(DType::F32);
        let y = HostLutGemv::new()
            .apply(&ones(1, 64, DType::F32), &codes, &codebooks, &scales, None)
            .unwrap();
        assert_eq!(y.to_f32_vec().unwrap(), scenario_expected());
    }

    #[test]
    fn test_matches_reference() {
        for (c, g, seed) in [(1, 8, 1u64), (2, 8, 2), (2, 4, 3), (4, 16, 4)] {
            let spec = LayerSpec::new(c, 256, 1, g, g * 6, 24);
            let layer = QuantizedLayer::random(&spec, seed).unwrap();
            let x = random_input(3, g * 6, DType::F32, seed + 100).unwrap();
            let bias = random_input(1, 24, DType::F32, seed + 200).unwrap().reshape(vec![24]).unwrap();

            let got = HostLutGemv::new()
                .apply(&x, &layer.codes, &layer.codebooks, &layer.scales, Some(&bias))
                .unwrap();
            let want = dequantize_gemm(&x, &layer.codes, &layer.codebooks, &layer.scales, Some(&bias)).unwrap();
            let mag = magnitude(&x, &layer.codes, &layer.codebooks, &layer.scales);
            assert_close(&got, &want, &mag, 1e-5);
        }
    }

    #[test]
    fn test_per_input_group_scales() {
        let spec = LayerSpec::new(2, 256, 1, 4, 16, 8);
        let layer = QuantizedLayer::random(&spec, 9).unwrap();
        let scales = Tensor::from_vec(vec![1, 4, 1, 1], vec![2.0f32, 0.5, 1.0, 4.0]).unwrap();
        let x = random_input(1, 16, DType::F32, 10).unwrap();

        let got = HostLutGemv::new()
            .apply_with_layout(&x, &layer.codes, &layer.codebooks, &scales, ScaleLayout::PerInputGroup, None)
            .unwrap();
        let want = dequantize_gemm_with_layout(
            &x,
            &layer.codes,
            &layer.codebooks,
            &scales,
            ScaleLayout::PerInputGroup,
            None,
        )
        .unwrap();
        let mag = magnitude_with_layout(&x, &layer.codes, &layer.codebooks, &scales, ScaleLayout::PerInputGroup);
        assert_close(&got, &want, &mag, 1e-5);
    }

    #[test]
    fn test_rejects_vector_groups() {
        let layer = QuantizedLayer::random(&LayerSpec::new(1, 256, 2, 4, 16, 8), 0).unwrap();
        let err = HostLutGemv::new()
            .apply(&ones(1, 16, DType::F32), &layer.codes, &layer.codebooks, &layer.scales, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
