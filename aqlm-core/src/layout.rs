//! Shape inference and precondition checks shared by every kernel.

use crate::error::{AqlmError, Result};
use crate::tensor::Tensor;

/// Which axis the scale tensor runs along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleLayout {
    /// `[num_out_groups, 1, 1, 1]`: one factor per output group, applied
    /// after the reduction.
    PerOutputGroup,
    /// `[1, num_in_groups, 1, 1]`: the role-swapped layout produced when a
    /// forward layer is transposed for the input gradient. Each input
    /// group's reconstructed block is scaled before the reduction.
    PerInputGroup,
}

/// Dimensions of one quantized layer, inferred from its three tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantShape {
    pub num_codebooks: usize,
    pub codebook_size: usize,
    pub out_group_size: usize,
    pub in_group_size: usize,
    pub num_out_groups: usize,
    pub num_in_groups: usize,
    pub scale_layout: ScaleLayout,
}

impl QuantShape {
    /// Check `codes [no, ni, C]`, `codebooks [C, S, O, G]` and `scales`
    /// against each other. Scales must be `[no, 1, 1, 1]` for
    /// [`ScaleLayout::PerOutputGroup`] and `[1, ni, 1, 1]` for
    /// [`ScaleLayout::PerInputGroup`]; the layout is never guessed from the
    /// shape.
    pub fn infer(
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        scale_layout: ScaleLayout,
    ) -> Result<Self> {
        if !codebooks.dtype().is_float() {
            return Err(AqlmError::DTypeMismatch {
                tensor: "codebooks",
                expected: "a float dtype".into(),
                got: codebooks.dtype(),
            });
        }
        let &[num_codebooks, codebook_size, out_group_size, in_group_size] = codebooks.shape()
        else {
            return Err(AqlmError::ShapeMismatch {
                tensor: "codebooks",
                expected: "[num_codebooks, codebook_size, out_group_size, in_group_size]".into(),
                got: codebooks.shape().to_vec(),
            });
        };
        if codebooks.num_elements() == 0 {
            return Err(AqlmError::InvalidInput(format!(
                "codebooks must be non-empty, got shape {:?}",
                codebooks.shape()
            )));
        }

        let &[num_out_groups, num_in_groups, code_books] = codes.shape() else {
            return Err(AqlmError::ShapeMismatch {
                tensor: "codes",
                expected: format!("[num_out_groups, num_in_groups, {num_codebooks}]"),
                got: codes.shape().to_vec(),
            });
        };
        if code_books != num_codebooks || num_out_groups == 0 || num_in_groups == 0 {
            return Err(AqlmError::ShapeMismatch {
                tensor: "codes",
                expected: format!("[num_out_groups > 0, num_in_groups > 0, {num_codebooks}]"),
                got: codes.shape().to_vec(),
            });
        }

        if !scales.dtype().is_float() {
            return Err(AqlmError::DTypeMismatch {
                tensor: "scales",
                expected: "a float dtype".into(),
                got: scales.dtype(),
            });
        }
        let (expected, what) = match scale_layout {
            ScaleLayout::PerOutputGroup => ([num_out_groups, 1, 1, 1], "out_features / out_group_size"),
            ScaleLayout::PerInputGroup => ([1, num_in_groups, 1, 1], "in_features / in_group_size"),
        };
        if scales.shape() != expected {
            return Err(AqlmError::ShapeMismatch {
                tensor: "scales",
                expected: format!("{expected:?} ({what})"),
                got: scales.shape().to_vec(),
            });
        }

        Ok(Self {
            num_codebooks,
            codebook_size,
            out_group_size,
            in_group_size,
            num_out_groups,
            num_in_groups,
            scale_layout,
        })
    }

    pub fn in_features(&self) -> usize {
        self.num_in_groups * self.in_group_size
    }

    pub fn out_features(&self) -> usize {
        self.num_out_groups * self.out_group_size
    }

    /// Validate `input [..., in_features]` and return the number of rows.
    pub fn check_input(&self, input: &Tensor) -> Result<usize> {
        if !input.dtype().is_float() {
            return Err(AqlmError::DTypeMismatch {
                tensor: "input",
                expected: "a float dtype".into(),
                got: input.dtype(),
            });
        }
        let Some(&in_dim) = input.shape().last() else {
            return Err(AqlmError::InvalidInput(
                "input must have at least one dimension".into(),
            ));
        };
        if in_dim % self.in_group_size != 0 {
            return Err(AqlmError::InvalidInput(format!(
                "in_features {in_dim} is not divisible by in_group_size {}",
                self.in_group_size
            )));
        }
        if in_dim != self.in_features() {
            return Err(AqlmError::ShapeMismatch {
                tensor: "input",
                expected: format!("[..., {}]", self.in_features()),
                got: input.shape().to_vec(),
            });
        }
        Ok(input.num_elements() / in_dim)
    }

    /// Validate the optional `bias [out_features]`.
    pub fn check_bias(&self, bias: Option<&Tensor>) -> Result<()> {
        let Some(bias) = bias else {
            return Ok(());
        };
        if !bias.dtype().is_float() {
            return Err(AqlmError::DTypeMismatch {
                tensor: "bias",
                expected: "a float dtype".into(),
                got: bias.dtype(),
            });
        }
        if bias.shape() != [self.out_features()] {
            return Err(AqlmError::ShapeMismatch {
                tensor: "bias",
                expected: format!("[{}]", self.out_features()),
                got: bias.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Shape of the result for `input [..., in_features]`.
    pub fn output_shape(&self, input: &Tensor) -> Vec<usize> {
        let mut shape = input.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = self.out_features();
        }
        shape
    }
}
