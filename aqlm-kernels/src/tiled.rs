//! Tiled fused dequantize-GEMV.
//!
//! One parallel unit per output group. A unit walks the input groups in
//! stages of `stage_groups`: it resolves the stage's codes, gathers and sums
//! the codebook entries into a `[stage, O, G]` block, then multiplies that
//! block into the input. The input-group axis is padded to a power of two
//! and lanes past `num_in_groups` are masked off, so neither the padding nor
//! the launch parameters touch the accumulation order.

use crate::GemvBackend;
use crate::config::{Accumulation, GemvOptions};
use crate::tuning::{self, LaunchParams, ShapeSignature, TuningCache};
use aqlm_core::codes::Codes;
use aqlm_core::tensor::try_filled;
use aqlm_core::{AqlmError, DType, Element, QuantShape, Result, ScaleLayout, Tensor};
use half::{bf16, f16};
use rayon::prelude::*;
use std::marker::PhantomData;
use std::sync::Arc;

pub struct TiledGemv {
    options: GemvOptions,
    tuning: Arc<TuningCache>,
}

impl TiledGemv {
    pub fn new(options: GemvOptions, tuning: Arc<TuningCache>) -> Self {
        Self { options, tuning }
    }

    /// Single-row entry point. `input` must be `[in_features]` or
    /// `[1, in_features]`.
    pub fn gemv(
        &self,
        input: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        if !matches!(input.shape(), [_] | [1, _]) {
            return Err(AqlmError::InvalidInput(format!(
                "single-row gemv expects input [in_features] or [1, in_features], got {:?}",
                input.shape()
            )));
        }
        self.apply(input, codes, codebooks, scales, bias)
    }

    fn padded_in_groups(&self, num_in_groups: usize) -> Result<usize> {
        match self.options.padded_in_groups {
            None => Ok(num_in_groups.next_power_of_two()),
            Some(p) if p >= num_in_groups => Ok(p),
            Some(p) => Err(AqlmError::InvalidInput(format!(
                "padded_in_groups {p} is smaller than num_in_groups {num_in_groups}"
            ))),
        }
    }

    fn run<T: Element>(
        &self,
        input: &Tensor,
        launch: Launch<'_, T>,
        bias: Option<&Tensor>,
        rows: usize,
    ) -> Result<Tensor> {
        match self.options.accumulation {
            Accumulation::F32 => self.execute::<T, Wide>(input, &launch, bias, rows),
            Accumulation::Storage => self.execute::<T, Narrow<T>>(input, &launch, bias, rows),
        }
    }

    fn execute<T: Element, A: Accumulate>(
        &self,
        input: &Tensor,
        launch: &Launch<'_, T>,
        bias: Option<&Tensor>,
        rows: usize,
    ) -> Result<Tensor> {
        let (n_in, n_out) = (launch.shape.in_features(), launch.shape.out_features());
        let x: Vec<f32> = input.to_f32_vec()?.into_iter().map(A::round).collect();
        let bias = bias.map(Tensor::to_f32_vec).transpose()?;
        let mut out = try_filled(rows * n_out, 0.0f32)?;

        if rows > 0 {
            let params = self.launch_params::<T, A>(launch, &x[..n_in])?;
            for (xr, y) in x.chunks_exact(n_in).zip(out.chunks_exact_mut(n_out)) {
                launch.run::<A>(params, xr, y);
                if let Some(b) = &bias {
                    for (v, bv) in y.iter_mut().zip(b) {
                        *v += bv;
                    }
                }
            }
        }

        Tensor::from_f32_as(launch.shape.output_shape(input), out, input.dtype())
    }

    /// Cached parameters for this shape, tuning on the first row when the
    /// cache misses.
    fn launch_params<T: Element, A: Accumulate>(
        &self,
        launch: &Launch<'_, T>,
        x: &[f32],
    ) -> Result<LaunchParams> {
        let sig = launch.signature(self.options.accumulation);
        if let Some(params) = self.tuning.get(&sig) {
            tracing::debug!(?sig, ?params, "tuning cache hit");
            return Ok(params);
        }

        let mut scratch = try_filled(sig.out_features, 0.0f32)?;
        let tuned = tuning::tune(self.options.tune, &tuning::candidates(&sig), |params| {
            launch.run::<A>(params, x, &mut scratch)
        });
        Ok(match tuned {
            Some(params) => {
                self.tuning.insert(sig, params);
                tracing::info!(
                    in_features = sig.in_features,
                    out_features = sig.out_features,
                    units_per_task = params.units_per_task,
                    stage_groups = params.stage_groups,
                    "tuned tiled gemv"
                );
                params
            }
            None => LaunchParams::heuristic(&sig),
        })
    }
}

impl GemvBackend for TiledGemv {
    fn name(&self) -> &str {
        "tiled"
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
        let rows = shape.check_input(input)?;
        shape.check_bias(bias)?;
        let codes = Codes::new(codes, shape.codebook_size)?;
        codes.validate()?;
        let padded = self.padded_in_groups(shape.num_in_groups)?;
        let scales = scales.to_f32_vec()?;

        match codebooks.dtype() {
            DType::F32 => {
                let launch = Launch::new(codes, codebooks.as_slice::<f32>()?, scales, shape, padded);
                self.run(input, launch, bias, rows)
            }
            DType::F16 => {
                let launch = Launch::new(codes, codebooks.as_slice::<f16>()?, scales, shape, padded);
                self.run(input, launch, bias, rows)
            }
            DType::BF16 => {
                let launch = Launch::new(codes, codebooks.as_slice::<bf16>()?, scales, shape, padded);
                self.run(input, launch, bias, rows)
            }
            got => Err(AqlmError::DTypeMismatch {
                tensor: "codebooks",
                expected: "f32, f16 or bf16".into(),
                got,
            }),
        }
    }
}

/// Rounding applied after every arithmetic step of a unit.
trait Accumulate {
    fn round(v: f32) -> f32;
}

/// Plain `f32` arithmetic.
struct Wide;

impl Accumulate for Wide {
    #[inline(always)]
    fn round(v: f32) -> f32 {
        v
    }
}

/// Every intermediate rounded through `T`.
struct Narrow<T>(PhantomData<T>);

impl<T: Element> Accumulate for Narrow<T> {
    #[inline(always)]
    fn round(v: f32) -> f32 {
        T::from_f32(v).to_f32()
    }
}

/// Per-task scratch.
struct Stage {
    idx: Vec<u32>,
    block: Vec<f32>,
    acc: Vec<f32>,
}

impl Stage {
    fn new(shape: &QuantShape, stage_groups: usize) -> Self {
        let entry = shape.out_group_size * shape.in_group_size;
        Self {
            idx: vec![0; stage_groups * shape.num_codebooks],
            block: vec![0.0; stage_groups * entry],
            acc: vec![0.0; shape.out_group_size],
        }
    }
}

/// A validated layer ready to run, borrowed from the caller's tensors.
struct Launch<'a, T> {
    codes: Codes<'a>,
    table: &'a [T],
    scales: Vec<f32>,
    shape: QuantShape,
    padded: usize,
}

impl<'a, T: Element> Launch<'a, T> {
    fn new(codes: Codes<'a>, table: &'a [T], scales: Vec<f32>, shape: QuantShape, padded: usize) -> Self {
        Self {
            codes,
            table,
            scales,
            shape,
            padded,
        }
    }

    fn signature(&self, accumulation: Accumulation) -> ShapeSignature {
        ShapeSignature {
            in_features: self.shape.in_features(),
            out_features: self.shape.out_features(),
            num_codebooks: self.shape.num_codebooks,
            codebook_size: self.shape.codebook_size,
            out_group_size: self.shape.out_group_size,
            in_group_size: self.shape.in_group_size,
            padded_in_groups: self.padded,
            accumulation,
        }
    }

    /// One input row into `out [out_features]`.
    fn run<A: Accumulate>(&self, params: LaunchParams, x: &[f32], out: &mut [f32]) {
        let o = self.shape.out_group_size;
        let per_task = params.units_per_task.max(1);
        let stage_groups = params.stage_groups.clamp(1, self.padded.max(1));

        out.par_chunks_mut(o * per_task).enumerate().for_each_init(
            || Stage::new(&self.shape, stage_groups),
            |stage, (task, chunk)| {
                for (u, y) in chunk.chunks_exact_mut(o).enumerate() {
                    let og = task * per_task + u;
                    if o == 1 {
                        y[0] = self.unit_scalar::<A>(og, stage_groups, x, stage);
                    } else {
                        self.unit_vector::<A>(og, stage_groups, x, stage, y);
                    }
                }
            },
        );
    }

    fn out_scale(&self, og: usize) -> f32 {
        match self.shape.scale_layout {
            ScaleLayout::PerOutputGroup => self.scales[og],
            ScaleLayout::PerInputGroup => 1.0,
        }
    }

    /// Number of unmasked input groups in the stage starting at `start`.
    fn live(&self, start: usize, stage_groups: usize) -> usize {
        self.shape.num_in_groups.min(start + stage_groups).saturating_sub(start)
    }

    /// Resolve codes and reconstruct the `[live, O, G]` weight block of
    /// input groups `start..start + live` for output group `og`.
    fn gather<A: Accumulate>(&self, og: usize, start: usize, live: usize, stage: &mut Stage) {
        let QuantShape {
            num_codebooks: nc,
            codebook_size: s,
            out_group_size: o,
            in_group_size: g,
            num_in_groups: ni,
            scale_layout,
            ..
        } = self.shape;
        let entry = o * g;

        let idx = &mut stage.idx[..live * nc];
        self.codes.decode_into((og * ni + start) * nc, idx);

        for (jj, (codes, block)) in idx
            .chunks_exact(nc)
            .zip(stage.block.chunks_exact_mut(entry))
            .enumerate()
        {
            block.fill(0.0);
            for (c, &code) in codes.iter().enumerate() {
                let row = (c * s + code as usize) * entry;
                for (w, &cb) in block.iter_mut().zip(&self.table[row..row + entry]) {
                    *w = A::round(*w + cb.to_f32());
                }
            }
            if scale_layout == ScaleLayout::PerInputGroup {
                let scale = self.scales[start + jj];
                for w in block.iter_mut() {
                    *w = A::round(*w * scale);
                }
            }
        }
    }

    /// `O = 1`: a single running sum.
    fn unit_scalar<A: Accumulate>(&self, og: usize, stage_groups: usize, x: &[f32], stage: &mut Stage) -> f32 {
        let g = self.shape.in_group_size;
        let mut acc = 0.0f32;
        for start in (0..self.padded).step_by(stage_groups) {
            let live = self.live(start, stage_groups);
            if live == 0 {
                continue;
            }
            self.gather::<A>(og, start, live, stage);
            let xs = &x[start * g..(start + live) * g];
            for (&w, &xv) in stage.block[..live * g].iter().zip(xs) {
                acc = A::round(acc + A::round(w * xv));
            }
        }
        A::round(acc * self.out_scale(og))
    }

    /// `O > 1`: one running sum per out-group position.
    fn unit_vector<A: Accumulate>(
        &self,
        og: usize,
        stage_groups: usize,
        x: &[f32],
        stage: &mut Stage,
        out: &mut [f32],
    ) {
        let g = self.shape.in_group_size;
        let entry = self.shape.out_group_size * g;
        let mut acc = std::mem::take(&mut stage.acc);
        acc.fill(0.0);

        for start in (0..self.padded).step_by(stage_groups) {
            let live = self.live(start, stage_groups);
            if live == 0 {
                continue;
            }
            self.gather::<A>(og, start, live, stage);
            for jj in 0..live {
                let xs = &x[(start + jj) * g..(start + jj + 1) * g];
                let block = &stage.block[jj * entry..(jj + 1) * entry];
                for (a, w) in acc.iter_mut().zip(block.chunks_exact(g)) {
                    for (&wv, &xv) in w.iter().zip(xs) {
                        *a = A::round(*a + A::round(wv * xv));
                    }
                }
            }
        }

        let scale = self.out_scale(og);
        for (y, &a) in out.iter_mut().zip(&acc) {
            *y = A::round(a * scale);
        }
        stage.acc = acc;
    }
}
