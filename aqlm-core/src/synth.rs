//! Seeded synthetic layers for checks, tuning runs and benchmarks.

use crate::dtype::DType;
use crate::error::{AqlmError, Result};
use crate::tensor::{Tensor, try_filled};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Dimensions and storage types of a synthetic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    pub num_codebooks: usize,
    pub codebook_size: usize,
    pub out_group_size: usize,
    pub in_group_size: usize,
    pub in_features: usize,
    pub out_features: usize,
    pub codebook_dtype: DType,
    pub code_dtype: DType,
}

impl LayerSpec {
    /// Codes stored in the narrowest signed type for `codebook_size`.
    pub fn new(
        num_codebooks: usize,
        codebook_size: usize,
        out_group_size: usize,
        in_group_size: usize,
        in_features: usize,
        out_features: usize,
    ) -> Self {
        Self {
            num_codebooks,
            codebook_size,
            out_group_size,
            in_group_size,
            in_features,
            out_features,
            codebook_dtype: DType::F32,
            code_dtype: DType::for_codebook_size(codebook_size),
        }
    }

    pub fn with_codebook_dtype(mut self, dtype: DType) -> Self {
        self.codebook_dtype = dtype;
        self
    }

    fn check(&self) -> Result<()> {
        let dims = [
            self.num_codebooks,
            self.codebook_size,
            self.out_group_size,
            self.in_group_size,
            self.in_features,
            self.out_features,
        ];
        if dims.contains(&0) {
            return Err(AqlmError::InvalidInput(format!("zero dimension in {self:?}")));
        }
        if self.in_features % self.in_group_size != 0 {
            return Err(AqlmError::InvalidInput(format!(
                "in_features {} is not divisible by in_group_size {}",
                self.in_features, self.in_group_size
            )));
        }
        if self.out_features % self.out_group_size != 0 {
            return Err(AqlmError::InvalidInput(format!(
                "out_features {} is not divisible by out_group_size {}",
                self.out_features, self.out_group_size
            )));
        }
        Ok(())
    }
}

/// Codes, codebooks and scales of one quantized linear layer.
#[derive(Debug, Clone)]
pub struct QuantizedLayer {
    pub codes: Tensor,
    pub codebooks: Tensor,
    pub scales: Tensor,
}

impl QuantizedLayer {
    /// Uniform codes over the whole codebook, small centred codebook values
    /// and positive scales, all drawn from `seed`.
    pub fn random(spec: &LayerSpec, seed: u64) -> Result<Self> {
        spec.check()?;
        let mut rng = StdRng::seed_from_u64(seed);

        let num_out_groups = spec.out_features / spec.out_group_size;
        let num_in_groups = spec.in_features / spec.in_group_size;

        let n_codes = num_out_groups * num_in_groups * spec.num_codebooks;
        let mut raw = try_filled(n_codes, 0u32)?;
        for v in raw.iter_mut() {
            *v = rng.gen_range(0..spec.codebook_size as u32);
        }
        let codes = encode_codes(
            vec![num_out_groups, num_in_groups, spec.num_codebooks],
            &raw,
            spec.code_dtype,
            spec.codebook_size,
        )?;

        let cb_shape = vec![
            spec.num_codebooks,
            spec.codebook_size,
            spec.out_group_size,
            spec.in_group_size,
        ];
        let n_cb = cb_shape.iter().product();
        let mut cb = try_filled(n_cb, 0.0f32)?;
        for v in cb.iter_mut() {
            *v = rng.gen_range(-0.5f32..0.5);
        }
        let codebooks = Tensor::from_f32_as(cb_shape, cb, spec.codebook_dtype)?;

        let sc: Vec<f32> = (0..num_out_groups).map(|_| rng.gen_range(0.25f32..1.5)).collect();
        let scales = Tensor::from_f32_as(vec![num_out_groups, 1, 1, 1], sc, spec.codebook_dtype)?;

        Ok(Self {
            codes,
            codebooks,
            scales,
        })
    }
}

/// Store logical indices into a `codebook_size`-entry codebook in `dtype`.
/// Indices past the positive range of `i8`/`i16` are stored as
/// `index - codebook_size`, the way persisted checkpoints do.
pub fn encode_codes(
    shape: Vec<usize>,
    indices: &[u32],
    dtype: DType,
    codebook_size: usize,
) -> Result<Tensor> {
    if dtype.code_capacity().is_some_and(|cap| codebook_size > cap) {
        return Err(AqlmError::DTypeMismatch {
            tensor: "codes",
            expected: format!("integer storage able to index {codebook_size} entries"),
            got: dtype,
        });
    }
    let wrap = |index: u32, max: i64| {
        let v = index as i64;
        if v > max { v - codebook_size as i64 } else { v }
    };
    match dtype {
        DType::U8 => Tensor::from_vec(shape, indices.iter().map(|&v| v as u8).collect()),
        DType::I8 => {
            Tensor::from_vec(shape, indices.iter().map(|&v| wrap(v, i8::MAX as i64) as i8).collect())
        }
        DType::U16 => Tensor::from_vec(shape, indices.iter().map(|&v| v as u16).collect()),
        DType::I16 => {
            Tensor::from_vec(shape, indices.iter().map(|&v| wrap(v, i16::MAX as i64) as i16).collect())
        }
        DType::I32 => Tensor::from_vec(shape, indices.iter().map(|&v| v as i32).collect()),
        other => Err(AqlmError::DTypeMismatch {
            tensor: "codes",
            expected: "an integer dtype".into(),
            got: other,
        }),
    }
}

/// `[rows, in_features]` activations in `[-1, 1)`.
pub fn random_input(rows: usize, in_features: usize, dtype: DType, seed: u64) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = try_filled(rows * in_features, 0.0f32)?;
    for v in x.iter_mut() {
        *v = rng.gen_range(-1.0f32..1.0);
    }
    Tensor::from_f32_as(vec![rows, in_features], x, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::Codes;
    use crate::layout::{QuantShape, ScaleLayout};

    #[test]
    fn test_random_layer_is_consistent() {
        let spec = LayerSpec::new(2, 256, 1, 8, 64, 16);
        let layer = QuantizedLayer::random(&spec, 7).unwrap();
        let shape = QuantShape::infer(&layer.codes, &layer.codebooks, &layer.scales, ScaleLayout::PerOutputGroup).unwrap();
        assert_eq!(shape.in_features(), 64);
        assert_eq!(shape.out_features(), 16);
        assert_eq!(layer.codes.dtype(), DType::I8);
        Codes::new(&layer.codes, 256).unwrap().validate().unwrap();
    }

    #[test]
    fn test_seed_is_deterministic() {
        let spec = LayerSpec::new(1, 16, 2, 4, 32, 8).with_codebook_dtype(DType::F16);
        let a = QuantizedLayer::random(&spec, 3).unwrap();
        let b = QuantizedLayer::random(&spec, 3).unwrap();
        assert_eq!(a.codes, b.codes);
        assert_eq!(a.codebooks, b.codebooks);
        assert_eq!(random_input(2, 32, DType::F32, 1).unwrap(), random_input(2, 32, DType::F32, 1).unwrap());
    }

    #[test]
    fn test_encode_wraps_signed() {
        let t = encode_codes(vec![2], &[255, 65535], DType::I16, 65536).unwrap();
        assert_eq!(t.as_slice::<i16>().unwrap(), &[255, -1]);
        let codes = Codes::new(&t, 65536).unwrap();
        assert_eq!(codes.get(1), 65535);

        // partial codebook: the negative half is offset by the codebook size
        let t = encode_codes(vec![3], &[127, 143, 199], DType::I8, 200).unwrap();
        assert_eq!(t.as_slice::<i8>().unwrap(), &[127, -57, -1]);
        let codes = Codes::new(&t, 200).unwrap();
        let mut out = [0u32; 3];
        codes.decode_into(0, &mut out);
        assert_eq!(out, [127, 143, 199]);

        assert!(encode_codes(vec![1], &[0], DType::I8, 512).is_err());
    }

    #[test]
    fn test_rejects_bad_spec() {
        assert!(QuantizedLayer::random(&LayerSpec::new(1, 16, 1, 8, 60, 4), 0).is_err());
        assert!(QuantizedLayer::random(&LayerSpec::new(1, 16, 3, 8, 64, 4), 0).is_err());
    }
}
