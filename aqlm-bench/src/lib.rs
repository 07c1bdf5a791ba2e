//! Shared fixtures for the benches.

use aqlm_core::synth::{LayerSpec, QuantizedLayer, random_input};
use aqlm_core::{DType, Result, Tensor};

/// A named layer shape the benches sweep over.
#[derive(Debug, Clone, Copy)]
pub struct BenchShape {
    pub name: &'static str,
    pub spec: LayerSpec,
}

/// The two checkpoint layouts with dedicated kernels plus a grouped-output
/// layout only the reference handles, all at 4096 x 4096.
pub fn shapes() -> [BenchShape; 3] {
    [
        BenchShape {
            name: "1x16",
            spec: LayerSpec::new(1, 65536, 1, 8, 4096, 4096).with_codebook_dtype(DType::F16),
        },
        BenchShape {
            name: "2x8",
            spec: LayerSpec::new(2, 256, 1, 8, 4096, 4096).with_codebook_dtype(DType::F16),
        },
        BenchShape {
            name: "1x8-o2",
            spec: LayerSpec::new(1, 256, 2, 8, 4096, 4096).with_codebook_dtype(DType::F16),
        },
    ]
}

/// Layer plus a single-row input in the codebook dtype.
pub fn fixture(shape: &BenchShape) -> Result<(QuantizedLayer, Tensor)> {
    let layer = QuantizedLayer::random(&shape.spec, 0x5eed)?;
    let x = random_input(1, shape.spec.in_features, shape.spec.codebook_dtype, 1)?;
    Ok((layer, x))
}
