//! Input gradient of a quantized layer through the forward kernels.
//!
//! `dL/dx = Wᵀ · dL/dy`, and `Wᵀ` is itself an additive-quantized matrix:
//! swap the group axes of the codes, the in/out positions of the codebook
//! entries, and move the scales onto the new input axis. The role-swapped
//! layer has `O` and `G` exchanged, so the forward kernel is selected for
//! [`KernelConfig::transposed`].

use crate::config::KernelConfig;
use crate::registry::Registry;
use crate::selector::{Kernel, select_with};
use aqlm_core::{Result, ScaleLayout, Tensor};

#[derive(Debug, Clone)]
pub struct BackwardKernel {
    forward: Kernel,
}

/// Backward kernel from the process-wide [`Registry`].
pub fn select_backward(config: &KernelConfig) -> Result<BackwardKernel> {
    select_backward_with(Registry::global(), config)
}

pub fn select_backward_with(registry: &Registry, config: &KernelConfig) -> Result<BackwardKernel> {
    let forward = select_with(registry, &config.transposed())?;
    tracing::debug!(%config, rule = forward.rule().name(), "backward kernel selected");
    Ok(BackwardKernel { forward })
}

impl BackwardKernel {
    /// Forward kernel the gradient runs through.
    pub fn forward(&self) -> &Kernel {
        &self.forward
    }

    /// `grad_output [..., out_features] -> grad_input [..., in_features]`
    /// for the layer `(codes, codebooks, scales)` in its forward layout.
    /// Bias has no input gradient; it is accepted for signature parity and
    /// ignored.
    pub fn apply(
        &self,
        grad_output: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        _bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let codes_t = codes.transpose(0, 1)?;
        let codebooks_t = codebooks.transpose(2, 3)?;
        let scales_t = scales.transpose(0, 1)?.transpose(2, 3)?;
        self.forward
            .apply_with_layout(grad_output, &codes_t, &codebooks_t, &scales_t, ScaleLayout::PerInputGroup, None)
    }
}
