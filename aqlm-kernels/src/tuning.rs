//! Empirical launch-parameter search for the tiled kernel, cached per shape.
//!
//! Launch parameters only decide how output units are batched into tasks
//! and how many input groups are decoded ahead of the reduction. The
//! reduction order is fixed by the kernel, so any entry in the search space
//! produces bit-identical output.

use crate::config::Accumulation;
use aqlm_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Cache key: everything that can change the best launch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeSignature {
    pub in_features: usize,
    pub out_features: usize,
    pub num_codebooks: usize,
    pub codebook_size: usize,
    pub out_group_size: usize,
    pub in_group_size: usize,
    pub padded_in_groups: usize,
    pub accumulation: Accumulation,
}

impl ShapeSignature {
    pub fn num_units(&self) -> usize {
        self.out_features / self.out_group_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchParams {
    /// Output groups handled by one parallel task.
    pub units_per_task: usize,
    /// Input groups decoded and gathered per pipeline stage.
    pub stage_groups: usize,
}

const UNITS_PER_TASK: [usize; 5] = [1, 2, 4, 8, 16];
const STAGE_GROUPS: [usize; 5] = [1, 2, 4, 8, 16];

impl LaunchParams {
    /// Untuned default: about four tasks per worker thread, eight groups per
    /// stage.
    pub fn heuristic(sig: &ShapeSignature) -> Self {
        let threads = rayon::current_num_threads().max(1);
        let per_task = (sig.num_units() / (threads * 4)).clamp(1, 16);
        Self {
            units_per_task: prev_power_of_two(per_task),
            stage_groups: 8.min(sig.padded_in_groups).max(1),
        }
    }
}

fn prev_power_of_two(n: usize) -> usize {
    if n == 0 { 1 } else { 1 << (usize::BITS - 1 - n.leading_zeros()) }
}

/// Search effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuneLevel {
    /// Use cached parameters or the heuristic; never measure.
    Off,
    /// One warmup, one timed run per candidate.
    #[default]
    Fast,
    /// One warmup, median of five timed runs per candidate.
    Thorough,
}

impl TuneLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "off" | "none" => Some(TuneLevel::Off),
            "fast" => Some(TuneLevel::Fast),
            "thorough" | "full" => Some(TuneLevel::Thorough),
            _ => None,
        }
    }

    fn timed_runs(&self) -> usize {
        match self {
            TuneLevel::Off => 0,
            TuneLevel::Fast => 1,
            TuneLevel::Thorough => 5,
        }
    }
}

/// Search space for `sig`, skipping values larger than the problem.
pub fn candidates(sig: &ShapeSignature) -> Vec<LaunchParams> {
    let units = sig.num_units().max(1);
    let groups = sig.padded_in_groups.max(1);
    let mut out = Vec::new();
    for &units_per_task in UNITS_PER_TASK.iter().filter(|&&u| u <= units) {
        for &stage_groups in STAGE_GROUPS.iter().filter(|&&s| s <= groups) {
            out.push(LaunchParams {
                units_per_task,
                stage_groups,
            });
        }
    }
    out
}

/// Time `run` for every candidate and return the fastest. `None` when
/// there is nothing to measure.
pub fn tune<F>(level: TuneLevel, candidates: &[LaunchParams], mut run: F) -> Option<LaunchParams>
where
    F: FnMut(LaunchParams),
{
    let runs = level.timed_runs();
    if runs == 0 {
        return None;
    }

    let mut best: Option<(Duration, LaunchParams)> = None;
    let mut samples = Vec::with_capacity(runs);
    for &params in candidates {
        run(params);
        samples.clear();
        for _ in 0..runs {
            let start = Instant::now();
            run(params);
            samples.push(start.elapsed());
        }
        samples.sort_unstable();
        let median = samples[samples.len() / 2];
        tracing::trace!(?params, ?median, "tuning candidate");
        if best.is_none_or(|(t, _)| median < t) {
            best = Some((median, params));
        }
    }
    best.map(|(_, p)| p)
}

#[derive(Debug, Serialize, Deserialize)]
struct TuningEntry {
    signature: ShapeSignature,
    params: LaunchParams,
}

#[derive(Debug, Serialize, Deserialize)]
struct TuningFile {
    version: u32,
    entries: Vec<TuningEntry>,
}

const TUNING_FILE_VERSION: u32 = 1;

/// Launch parameters chosen per shape signature.
///
/// Populated idempotently: two threads missing on the same signature may
/// both tune, and whichever insert lands last wins.
#[derive(Debug, Default)]
pub struct TuningCache {
    entries: RwLock<HashMap<ShapeSignature, LaunchParams>>,
}

impl TuningCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sig: &ShapeSignature) -> Option<LaunchParams> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sig)
            .copied()
    }

    pub fn insert(&self, sig: ShapeSignature, params: LaunchParams) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sig, params);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all entries as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut entries: Vec<TuningEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(signature, params)| TuningEntry {
                signature: *signature,
                params: *params,
            })
            .collect();
        entries.sort_by_key(|e| {
            (
                e.signature.out_features,
                e.signature.in_features,
                e.signature.num_codebooks,
                e.signature.codebook_size,
            )
        });
        let file = TuningFile {
            version: TUNING_FILE_VERSION,
            entries,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        tracing::info!(path = %path.display(), entries = file.entries.len(), "tuning cache saved");
        Ok(())
    }

    /// Read entries written by [`TuningCache::save`], replacing any
    /// in-memory entry for the same signature. Files from another format
    /// version are ignored, and so is any entry whose parameters are not in
    /// the search space of its signature. Returns the number of entries
    /// kept.
    pub fn load_into(&self, path: &Path) -> Result<usize> {
        let file: TuningFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if file.version != TUNING_FILE_VERSION {
            tracing::warn!(
                path = %path.display(),
                version = file.version,
                "ignoring tuning cache with unknown version"
            );
            return Ok(0);
        }
        let mut n = 0;
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for e in file.entries {
            if !candidates(&e.signature).contains(&e.params) {
                tracing::warn!(
                    path = %path.display(),
                    signature = ?e.signature,
                    params = ?e.params,
                    "skipping tuning entry outside the search space"
                );
                continue;
            }
            map.insert(e.signature, e.params);
            n += 1;
        }
        tracing::debug!(path = %path.display(), entries = n, "tuning cache loaded");
        Ok(n)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let cache = Self::new();
        cache.load_into(path)?;
        Ok(cache)
    }
}
