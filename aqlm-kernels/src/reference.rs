use crate::GemvBackend;
use aqlm_core::dequant::dequantize_gemm_with_layout;
use aqlm_core::{Result, ScaleLayout, Tensor};

/// Catch-all backend: materializes the dense weight, then multiplies densely.
#[derive(Debug, Default)]
pub struct ReferenceGemm;

impl ReferenceGemm {
    pub fn new() -> Self {
        Self
    }
}

impl GemvBackend for ReferenceGemm {
    fn name(&self) -> &str {
        "reference"
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
        dequantize_gemm_with_layout(input, codes, codebooks, scales, scale_layout, bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ones, scenario_expected, scenario_layer};
    use aqlm_core::DType;

    #[test]
    fn test_scenario_known_values() {
        let (codes, codebooks, scales) = scenario_layer(DType::BF16);
        let y = ReferenceGemm::new()
            .apply(&ones(1, 64, DType::F32), &codes, &codebooks, &scales, None)
            .unwrap();
        assert_eq!(y.to_f32_vec().unwrap(), scenario_expected());
    }
}
