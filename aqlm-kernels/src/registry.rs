//! Lazily constructed backends, one slot per selection rule.

use crate::GemvBackend;
use crate::config::GemvOptions;
use crate::host::HostLutGemv;
use crate::reference::ReferenceGemm;
use crate::selector::Rule;
use crate::specialized::{Entry, SpecializedGemv};
use crate::tiled::TiledGemv;
use crate::tuning::TuningCache;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Environment variable naming a tuning cache file the global registry
/// preloads.
pub const TUNING_CACHE_ENV: &str = "AQLM_TUNING_CACHE";

pub struct Registry {
    options: GemvOptions,
    tuning: Arc<TuningCache>,
    slots: [OnceLock<Arc<dyn GemvBackend>>; Rule::COUNT],
}

impl Registry {
    pub fn new(options: GemvOptions) -> Self {
        Self::with_tuning_cache(options, Arc::new(TuningCache::new()))
    }

    pub fn with_tuning_cache(options: GemvOptions, tuning: Arc<TuningCache>) -> Self {
        Self {
            options,
            tuning,
            slots: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Process-wide registry with default options, used by
    /// [`select`](crate::select). Preloads the tuning cache named by
    /// `AQLM_TUNING_CACHE` when set.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let registry = Registry::new(GemvOptions::default());
            if let Some(path) = std::env::var_os(TUNING_CACHE_ENV).map(PathBuf::from) {
                match registry.tuning.load_into(&path) {
                    Ok(entries) => {
                        tracing::info!(path = %path.display(), entries, "preloaded tuning cache")
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "could not load tuning cache")
                    }
                }
            }
            registry
        })
    }

    pub fn options(&self) -> &GemvOptions {
        &self.options
    }

    pub fn tuning_cache(&self) -> &Arc<TuningCache> {
        &self.tuning
    }

    /// Whether the backend for `rule` has been constructed yet.
    pub fn is_loaded(&self, rule: Rule) -> bool {
        self.slots[rule.index()].get().is_some()
    }

    /// Backend for `rule`, constructed on first use.
    pub fn backend(&self, rule: Rule) -> Arc<dyn GemvBackend> {
        self.slots[rule.index()]
            .get_or_init(|| {
                let backend: Arc<dyn GemvBackend> = match rule {
                    Rule::Code1x16 => Arc::new(SpecializedGemv::new(Entry::Code1x16)),
                    Rule::Code2x8 => Arc::new(SpecializedGemv::new(Entry::Code2x8)),
                    Rule::Tiled => Arc::new(TiledGemv::new(self.options, self.tuning.clone())),
                    Rule::HostLut => {
                        tracing::debug!(simd = aqlm_core::simd::level_name(), "host lookup kernel");
                        Arc::new(HostLutGemv::new())
                    }
                    Rule::Reference => {
                        tracing::warn!("no fused kernel for this configuration, using dense reference");
                        Arc::new(ReferenceGemm::new())
                    }
                };
                tracing::info!(rule = rule.name(), backend = backend.name(), "backend loaded");
                backend
            })
            .clone()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaded: Vec<&str> = Rule::ALL
            .iter()
            .filter(|r| self.is_loaded(**r))
            .map(|r| r.name())
            .collect();
        f.debug_struct("Registry")
            .field("options", &self.options)
            .field("tuning_entries", &self.tuning.len())
            .field("loaded", &loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_load_lazily() {
        let registry = Registry::new(GemvOptions::default());
        assert!(Rule::ALL.iter().all(|r| !registry.is_loaded(*r)));

        let tiled = registry.backend(Rule::Tiled);
        assert_eq!(tiled.name(), "tiled");
        assert!(registry.is_loaded(Rule::Tiled));
        assert!(!registry.is_loaded(Rule::Reference));

        let again = registry.backend(Rule::Tiled);
        assert!(Arc::ptr_eq(&tiled, &again));
    }

    #[test]
    fn test_backend_names() {
        let registry = Registry::new(GemvOptions::default());
        let names: Vec<String> = Rule::ALL
            .iter()
            .map(|r| registry.backend(*r).name().to_string())
            .collect();
        assert_eq!(
            names,
            ["code1x16_matmat", "code2x8_matmat", "tiled", "host-lut", "reference"]
        );
    }

    #[test]
    fn test_shared_tuning_cache() {
        let cache = Arc::new(TuningCache::new());
        let registry = Registry::with_tuning_cache(GemvOptions::default(), cache.clone());
        assert!(Arc::ptr_eq(registry.tuning_cache(), &cache));
    }
}
