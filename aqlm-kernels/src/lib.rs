pub mod backward;
pub mod config;
pub mod host;
pub mod reference;
pub mod registry;
pub mod selector;
pub mod specialized;
pub mod tiled;
pub mod tuning;

#[cfg(test)]
mod test_util;

pub use backward::{BackwardKernel, select_backward, select_backward_with};
pub use config::{Accumulation, DeviceClass, GemvOptions, KernelConfig};
pub use registry::Registry;
pub use selector::{Kernel, Rule, select, select_rule, select_with};
pub use tuning::{LaunchParams, ShapeSignature, TuneLevel, TuningCache};

use aqlm_core::{Result, ScaleLayout, Tensor};

/// One implementation of `output = scale * reconstruct(codes, codebooks) @ input (+ bias)`.
///
/// Shapes: `input [..., in_features]`, `codes [num_out_groups, num_in_groups, C]`,
/// `codebooks [C, S, O, G]`, `bias [out_features]`. Scales are
/// `[num_out_groups, 1, 1, 1]` for [`ScaleLayout::PerOutputGroup`] and
/// `[1, num_in_groups, 1, 1]` for the role-swapped
/// [`ScaleLayout::PerInputGroup`] that only the backward adapter passes.
/// The output has the input's leading dims and dtype.
///
/// Implementations validate every precondition before writing output and
/// never mutate their arguments.
pub trait GemvBackend: Send + Sync {
    fn name(&self) -> &str;

    fn apply_with_layout(
        &self,
        input: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        scale_layout: ScaleLayout,
        bias: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// Forward call: scales must be `[num_out_groups, 1, 1, 1]`.
    fn apply(
        &self,
        input: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.apply_with_layout(input, codes, codebooks, scales, ScaleLayout::PerOutputGroup, bias)
    }
}
