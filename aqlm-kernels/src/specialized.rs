//! Shape-specialized kernels for the two layouts most checkpoints ship:
//! one 65536-entry codebook (`code1x16`) and two 256-entry codebooks
//! (`code2x8`), both with `O = 1, G = 8` over f16 codebooks. The shape is a
//! compile-time constant so the group loop fully unrolls; accumulation is
//! always f32.

use crate::GemvBackend;
use aqlm_core::codes::Codes;
use aqlm_core::tensor::try_filled;
use aqlm_core::{AqlmError, DType, QuantShape, Result, ScaleLayout, Tensor};
use half::f16;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    Code1x16,
    Code2x8,
}

impl Entry {
    pub fn symbol(&self) -> &'static str {
        match self {
            Entry::Code1x16 => "code1x16_matmat",
            Entry::Code2x8 => "code2x8_matmat",
        }
    }

    /// `(num_codebooks, codebook_size, in_group_size)` the entry is built for.
    pub fn dims(&self) -> (usize, usize, usize) {
        match self {
            Entry::Code1x16 => (1, 65536, 8),
            Entry::Code2x8 => (2, 256, 8),
        }
    }

    pub fn launch(
        &self,
        input: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        scale_layout: ScaleLayout,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        match self {
            Entry::Code1x16 => matmat::<1, 65536, 8>(*self, input, codes, codebooks, scales, scale_layout, bias),
            Entry::Code2x8 => matmat::<2, 256, 8>(*self, input, codes, codebooks, scales, scale_layout, bias),
        }
    }
}

pub fn code1x16_matmat(
    input: &Tensor,
    codes: &Tensor,
    codebooks: &Tensor,
    scales: &Tensor,
    bias: Option<&Tensor>,
) -> Result<Tensor> {
    Entry::Code1x16.launch(input, codes, codebooks, scales, ScaleLayout::PerOutputGroup, bias)
}

pub fn code2x8_matmat(
    input: &Tensor,
    codes: &Tensor,
    codebooks: &Tensor,
    scales: &Tensor,
    bias: Option<&Tensor>,
) -> Result<Tensor> {
    Entry::Code2x8.launch(input, codes, codebooks, scales, ScaleLayout::PerOutputGroup, bias)
}

fn matmat<const C: usize, const S: usize, const G: usize>(
    entry: Entry,
    input: &Tensor,
    codes: &Tensor,
    codebooks: &Tensor,
    scales: &Tensor,
    scale_layout: ScaleLayout,
    bias: Option<&Tensor>,
) -> Result<Tensor> {
    if codebooks.dtype() != DType::F16 {
        return Err(AqlmError::config(format!(
            "{} requires f16 codebooks, got {}",
            entry.symbol(),
            codebooks.dtype()
        )));
    }
    if codebooks.shape() != [C, S, 1, G] {
        return Err(AqlmError::config(format!(
            "{} is built for codebooks [{C}, {S}, 1, {G}], got {:?}",
            entry.symbol(),
            codebooks.shape()
        )));
    }

    let shape = QuantShape::infer(codes, codebooks, scales, scale_layout)?;
    let rows = shape.check_input(input)?;
    shape.check_bias(bias)?;
    let codes = Codes::new(codes, S)?;
    codes.validate()?;

    let table = codebooks.as_slice::<f16>()?;
    let scales = scales.to_f32_vec()?;
    let x = input.to_f32_vec()?;
    let bias = bias.map(Tensor::to_f32_vec).transpose()?;

    let ni = shape.num_in_groups;
    let (n_in, n_out) = (shape.in_features(), shape.out_features());
    let per_input = shape.scale_layout == ScaleLayout::PerInputGroup;
    let mut out = try_filled(rows * n_out, 0.0f32)?;

    for (xr, y) in x.chunks_exact(n_in).zip(out.chunks_exact_mut(n_out)) {
        y.par_iter_mut().enumerate().for_each(|(i, yi)| {
            let mut acc = 0.0f32;
            for j in 0..ni {
                let mut w = [0.0f32; G];
                for c in 0..C {
                    let code = codes.get((i * ni + j) * C + c) as usize;
                    let row = (c * S + code) * G;
                    for (wv, e) in w.iter_mut().zip(&table[row..row + G]) {
                        *wv += e.to_f32();
                    }
                }
                if per_input {
                    for wv in w.iter_mut() {
                        *wv *= scales[j];
                    }
                }
                for (wv, xv) in w.iter().zip(&xr[j * G..(j + 1) * G]) {
                    acc += wv * xv;
                }
            }
            *yi = if per_input { acc } else { acc * scales[i] };
        });

        if let Some(b) = &bias {
            for (v, bv) in y.iter_mut().zip(b) {
                *v += bv;
            }
        }
    }

    Tensor::from_f32_as(shape.output_shape(input), out, input.dtype())
}

/// [`GemvBackend`] over one entry point.
#[derive(Debug)]
pub struct SpecializedGemv {
    entry: Entry,
}

impl SpecializedGemv {
    pub fn new(entry: Entry) -> Self {
        Self { entry }
    }
}

impl GemvBackend for SpecializedGemv {
    fn name(&self) -> &str {
        self.entry.symbol()
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
        self.entry.launch(input, codes, codebooks, scales, scale_layout, bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        assert_close, magnitude, magnitude_with_layout, ones, scenario_expected, scenario_layer,
    };
    use aqlm_core::ErrorKind;
    use aqlm_core::dequant::{dequantize_gemm, dequantize_gemm_with_layout};
    use aqlm_core::synth::{LayerSpec, QuantizedLayer, random_input};

    #[test]
    fn test_code2x8_scenario() {
        let (codes, codebooks, scales) = scenario_layer(DType::F16);
        let y = code2x8_matmat(&ones(1, 64, DType::F16), &codes, &codebooks, &scales, None).unwrap();
        assert_eq!(y.dtype(), DType::F16);
        assert_eq!(y.to_f32_vec().unwrap(), scenario_expected());
    }

    #[test]
    fn test_code1x16_matches_reference() {
        let spec = LayerSpec::new(1, 65536, 1, 8, 32, 8).with_codebook_dtype(DType::F16);
        let layer = QuantizedLayer::random(&spec, 3).unwrap();
        assert_eq!(layer.codes.dtype(), DType::I16);
        let x = random_input(2, 32, DType::F32, 4).unwrap();

        let got = SpecializedGemv::new(Entry::Code1x16)
            .apply(&x, &layer.codes, &layer.codebooks, &layer.scales, None)
            .unwrap();
        let want = dequantize_gemm(&x, &layer.codes, &layer.codebooks, &layer.scales, None).unwrap();
        let mag = magnitude(&x, &layer.codes, &layer.codebooks, &layer.scales);
        assert_close(&got, &want, &mag, 1e-5);
    }

    #[test]
    fn test_code2x8_per_input_scales_and_bias() {
        let spec = LayerSpec::new(2, 256, 1, 8, 24, 5).with_codebook_dtype(DType::F16);
        let layer = QuantizedLayer::random(&spec, 7).unwrap();
        let scales = Tensor::from_f32_as(vec![1, 3, 1, 1], vec![0.5, 2.0, 1.25], DType::F16).unwrap();
        let bias = Tensor::from_vec(vec![5], vec![1.0f32, -1.0, 0.5, 0.0, 2.0]).unwrap();
        let x = random_input(3, 24, DType::F32, 8).unwrap();

        let per_input = ScaleLayout::PerInputGroup;

        let got = SpecializedGemv::new(Entry::Code2x8)
            .apply_with_layout(&x, &layer.codes, &layer.codebooks, &scales, per_input, Some(&bias))
            .unwrap();
        let want =
            dequantize_gemm_with_layout(&x, &layer.codes, &layer.codebooks, &scales, per_input, Some(&bias)).unwrap();
        let mag = magnitude_with_layout(&x, &layer.codes, &layer.codebooks, &scales, per_input);
        assert_close(&got, &want, &mag, 1e-5);

        // the public forward entry point only takes per-output-group scales
        let err = code2x8_matmat(&x, &layer.codes, &layer.codebooks, &scales, Some(&bias)).unwrap_err();
        assert!(matches!(err, AqlmError::ShapeMismatch { tensor: "scales", .. }));
    }

    #[test]
    fn test_requires_f16_codebooks() {
        let (codes, codebooks, scales) = scenario_layer(DType::F32);
        let err = code2x8_matmat(&ones(1, 64, DType::F32), &codes, &codebooks, &scales, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("f16"));
    }

    #[test]
    fn test_rejects_other_shapes() {
        let (codes, codebooks, scales) = scenario_layer(DType::F16);
        let err = code1x16_matmat(&ones(1, 64, DType::F16), &codes, &codebooks, &scales, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(Entry::Code1x16.dims(), (1, 65536, 8));
        assert_eq!(SpecializedGemv::new(Entry::Code2x8).name(), "code2x8_matmat");
    }
}
