use crate::tuning::TuneLevel;
use aqlm_core::{AqlmError, DType, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the tensors of a layer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Host,
    Accelerator,
}

impl DeviceClass {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceClass::Host => "host",
            DeviceClass::Accelerator => "accelerator",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "host" | "cpu" => Some(DeviceClass::Host),
            "accelerator" | "gpu" | "cuda" => Some(DeviceClass::Accelerator),
            _ => None,
        }
    }
}

/// The tuple kernel selection is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelConfig {
    pub device: DeviceClass,
    pub num_codebooks: usize,
    pub codebook_size: usize,
    pub out_group_size: usize,
    pub in_group_size: usize,
    /// Storage precision of the codebooks; gates the specialized kernels.
    pub codebook_dtype: DType,
}

impl KernelConfig {
    /// Config for f16 codebooks, the precision models are normally loaded in.
    pub fn new(
        device: DeviceClass,
        num_codebooks: usize,
        codebook_size: usize,
        out_group_size: usize,
        in_group_size: usize,
    ) -> Self {
        Self {
            device,
            num_codebooks,
            codebook_size,
            out_group_size,
            in_group_size,
            codebook_dtype: DType::F16,
        }
    }

    pub fn with_codebook_dtype(mut self, dtype: DType) -> Self {
        self.codebook_dtype = dtype;
        self
    }

    /// Read `[C, S, O, G]` and the storage dtype off a codebook tensor.
    pub fn from_codebooks(device: DeviceClass, codebooks: &Tensor) -> Result<Self> {
        let &[c, s, o, g] = codebooks.shape() else {
            return Err(AqlmError::ShapeMismatch {
                tensor: "codebooks",
                expected: "[num_codebooks, codebook_size, out_group_size, in_group_size]".into(),
                got: codebooks.shape().to_vec(),
            });
        };
        Ok(Self::new(device, c, s, o, g).with_codebook_dtype(codebooks.dtype()))
    }

    /// Config of the role-swapped layer the input gradient runs through.
    pub fn transposed(&self) -> Self {
        Self {
            out_group_size: self.in_group_size,
            in_group_size: self.out_group_size,
            ..*self
        }
    }

    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (
            self.num_codebooks,
            self.codebook_size,
            self.out_group_size,
            self.in_group_size,
        )
    }

    /// Preconditions every rule shares.
    pub fn validate(&self) -> Result<()> {
        let (c, s, o, g) = self.dims();
        if c == 0 || s == 0 || o == 0 || g == 0 {
            return Err(AqlmError::config(format!(
                "num_codebooks, codebook_size, out_group_size and in_group_size must be positive, got {self}"
            )));
        }
        if !self.codebook_dtype.is_float() {
            return Err(AqlmError::config(format!(
                "codebooks must be stored as a float type, got {}",
                self.codebook_dtype
            )));
        }
        Ok(())
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} C={} S={} O={} G={} {}",
            self.device.name(),
            self.num_codebooks,
            self.codebook_size,
            self.out_group_size,
            self.in_group_size,
            self.codebook_dtype
        )
    }
}

/// Precision of the multiply-accumulate in the tiled kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accumulation {
    /// Upcast weights and activations to f32 before accumulating.
    #[default]
    F32,
    /// Round every intermediate back to the codebook storage type.
    Storage,
}

impl Accumulation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f32" | "fp32" => Some(Accumulation::F32),
            "storage" | "native" => Some(Accumulation::Storage),
            _ => None,
        }
    }
}

/// Runtime knobs of the kernels a registry hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemvOptions {
    pub accumulation: Accumulation,
    pub tune: TuneLevel,
    /// Input-group tile size of the tiled kernel. `None` pads to the next
    /// power of two; an explicit value must be at least `num_in_groups`.
    pub padded_in_groups: Option<usize>,
}

impl Default for GemvOptions {
    fn default() -> Self {
        Self {
            accumulation: Accumulation::F32,
            tune: TuneLevel::Fast,
            padded_in_groups: None,
        }
    }
}
