//! Kernel selection: an ordered rule table, first match wins.
//!
//! | # | device      | C | S     | O | G   | kernel          |
//! |---|-------------|---|-------|---|-----|-----------------|
//! | 1 | accelerator | 1 | 65536 | 1 | 8   | code1x16 (f16)  |
//! | 2 | accelerator | 2 | 256   | 1 | 8   | code2x8 (f16)   |
//! | 3 | accelerator | * | *     | 1 | *   | tiled           |
//! | 4 | host        | * | 256   | 1 | *   | host lookup     |
//! | 5 | *           | * | *     | * | *   | dense reference |
//!
//! Selection depends on the config alone. A config that matches rule 1 or 2
//! with codebooks in another precision is an error, not a fall-through.

use crate::GemvBackend;
use crate::config::{DeviceClass, KernelConfig};
use crate::registry::Registry;
use aqlm_core::{AqlmError, DType, Result, ScaleLayout, Tensor};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    Code1x16,
    Code2x8,
    Tiled,
    HostLut,
    Reference,
}

impl Rule {
    pub const COUNT: usize = 5;

    pub const ALL: [Rule; Rule::COUNT] = [
        Rule::Code1x16,
        Rule::Code2x8,
        Rule::Tiled,
        Rule::HostLut,
        Rule::Reference,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Rule::Code1x16 => "code1x16",
            Rule::Code2x8 => "code2x8",
            Rule::Tiled => "tiled",
            Rule::HostLut => "host-lut",
            Rule::Reference => "reference",
        }
    }

    /// 1-based position in the table.
    pub fn priority(&self) -> usize {
        self.index() + 1
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct RuleEntry {
    rule: Rule,
    matches: fn(&KernelConfig) -> bool,
    requires: Option<fn(Rule, &KernelConfig) -> Result<()>>,
}

static RULES: [RuleEntry; Rule::COUNT] = [
    RuleEntry {
        rule: Rule::Code1x16,
        matches: is_code1x16,
        requires: Some(require_f16),
    },
    RuleEntry {
        rule: Rule::Code2x8,
        matches: is_code2x8,
        requires: Some(require_f16),
    },
    RuleEntry {
        rule: Rule::Tiled,
        matches: is_accelerator_scalar,
        requires: None,
    },
    RuleEntry {
        rule: Rule::HostLut,
        matches: is_host_256,
        requires: None,
    },
    RuleEntry {
        rule: Rule::Reference,
        matches: always,
        requires: None,
    },
];

fn is_code1x16(c: &KernelConfig) -> bool {
    c.device == DeviceClass::Accelerator && c.dims() == (1, 65536, 1, 8)
}

fn is_code2x8(c: &KernelConfig) -> bool {
    c.device == DeviceClass::Accelerator && c.dims() == (2, 256, 1, 8)
}

fn is_accelerator_scalar(c: &KernelConfig) -> bool {
    c.device == DeviceClass::Accelerator && c.out_group_size == 1
}

fn is_host_256(c: &KernelConfig) -> bool {
    c.device == DeviceClass::Host && c.codebook_size == 256 && c.out_group_size == 1
}

fn always(_: &KernelConfig) -> bool {
    true
}

fn require_f16(rule: Rule, c: &KernelConfig) -> Result<()> {
    if c.codebook_dtype == DType::F16 {
        return Ok(());
    }
    Err(AqlmError::config(format!(
        "kernel {rule} requires f16 codebooks, got {} ({c})",
        c.codebook_dtype
    )))
}

/// Rule chosen for `config`, checking its precision requirement.
pub fn select_rule(config: &KernelConfig) -> Result<Rule> {
    config.validate()?;
    let entry = RULES
        .iter()
        .find(|e| (e.matches)(config))
        .unwrap_or(&RULES[RULES.len() - 1]);
    if let Some(requires) = entry.requires {
        requires(entry.rule, config)?;
    }
    tracing::debug!(%config, rule = entry.rule.name(), "kernel selected");
    Ok(entry.rule)
}

/// Select from the process-wide [`Registry`].
pub fn select(config: &KernelConfig) -> Result<Kernel> {
    select_with(Registry::global(), config)
}

pub fn select_with(registry: &Registry, config: &KernelConfig) -> Result<Kernel> {
    let rule = select_rule(config)?;
    Ok(Kernel {
        rule,
        config: *config,
        backend: registry.backend(rule),
    })
}

/// A selected kernel, callable once per forward pass.
#[derive(Clone)]
pub struct Kernel {
    rule: Rule,
    config: KernelConfig,
    backend: Arc<dyn GemvBackend>,
}

impl Kernel {
    pub fn rule(&self) -> Rule {
        self.rule
    }

    /// Name of the backend the rule resolved to.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Forward call with `scales [num_out_groups, 1, 1, 1]`.
    pub fn apply(
        &self,
        input: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.apply_with_layout(input, codes, codebooks, scales, ScaleLayout::PerOutputGroup, bias)
    }

    pub(crate) fn apply_with_layout(
        &self,
        input: &Tensor,
        codes: &Tensor,
        codebooks: &Tensor,
        scales: &Tensor,
        scale_layout: ScaleLayout,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (c, s, o, g) = self.config.dims();
        if codebooks.shape() != [c, s, o, g] {
            return Err(AqlmError::ShapeMismatch {
                tensor: "codebooks",
                expected: format!("[{c}, {s}, {o}, {g}] as selected for {}", self.config),
                got: codebooks.shape().to_vec(),
            });
        }
        self.backend
            .apply_with_layout(input, codes, codebooks, scales, scale_layout, bias)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("rule", &self.rule)
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GemvOptions;
    use crate::test_util::{ones, scenario_expected, scenario_layer};
    use crate::tuning::TuneLevel;
    use aqlm_core::ErrorKind;

    fn accel(c: usize, s: usize, o: usize, g: usize) -> KernelConfig {
        KernelConfig::new(DeviceClass::Accelerator, c, s, o, g)
    }

    fn host(c: usize, s: usize, o: usize, g: usize) -> KernelConfig {
        KernelConfig::new(DeviceClass::Host, c, s, o, g)
    }

    fn registry() -> Registry {
        Registry::new(GemvOptions {
            tune: TuneLevel::Off,
            ..GemvOptions::default()
        })
    }

    #[test]
    fn test_rule_table() {
        let cases = [
            (accel(1, 65536, 1, 8), Rule::Code1x16),
            (accel(2, 256, 1, 8), Rule::Code2x8),
            (accel(2, 256, 1, 4), Rule::Tiled),
            (accel(1, 65536, 1, 16), Rule::Tiled),
            (accel(3, 16, 1, 2), Rule::Tiled),
            (accel(2, 256, 2, 8), Rule::Reference),
            (host(2, 256, 1, 8), Rule::HostLut),
            (host(1, 256, 1, 4), Rule::HostLut),
            (host(1, 65536, 1, 8), Rule::Reference),
            (host(2, 256, 8, 1), Rule::Reference),
        ];
        for (config, rule) in cases {
            assert_eq!(select_rule(&config).unwrap(), rule, "{config}");
        }
    }

    #[test]
    fn test_priorities_follow_table_order() {
        let priorities: Vec<usize> = Rule::ALL.iter().map(Rule::priority).collect();
        assert_eq!(priorities, [1, 2, 3, 4, 5]);
        assert!(RULES.iter().zip(Rule::ALL).all(|(e, r)| e.rule == r));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let registry = registry();
        let config = accel(2, 256, 1, 4).with_codebook_dtype(DType::F32);
        let first = select_with(&registry, &config).unwrap();
        for _ in 0..4 {
            let again = select_with(&registry, &config).unwrap();
            assert_eq!(again.rule(), first.rule());
            assert_eq!(again.name(), first.name());
        }
        // a fresh registry with nothing loaded picks the same rule
        assert_eq!(select_with(&Registry::new(GemvOptions::default()), &config).unwrap().rule(), Rule::Tiled);
    }

    #[test]
    fn test_specialized_rules_require_f16() {
        for dtype in [DType::F32, DType::BF16] {
            for config in [accel(1, 65536, 1, 8), accel(2, 256, 1, 8)] {
                let err = select_rule(&config.with_codebook_dtype(dtype)).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Config);
                assert!(err.to_string().contains("requires f16"), "{err}");
            }
        }
        // the host table has no precision requirement
        assert_eq!(
            select_rule(&host(2, 256, 1, 8).with_codebook_dtype(DType::F32)).unwrap(),
            Rule::HostLut
        );
    }

    #[test]
    fn test_invalid_config() {
        let err = select_rule(&accel(0, 256, 1, 8)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_every_rule_runs_the_scenario() {
        let registry = registry();
        let cases = [
            (accel(2, 256, 1, 8), DType::F16, Rule::Code2x8),
            (host(2, 256, 1, 8).with_codebook_dtype(DType::F32), DType::F32, Rule::HostLut),
            (host(2, 256, 1, 8).with_codebook_dtype(DType::BF16), DType::BF16, Rule::HostLut),
        ];
        for (config, dtype, rule) in cases {
            let kernel = select_with(&registry, &config).unwrap();
            assert_eq!(kernel.rule(), rule);
            let (codes, codebooks, scales) = scenario_layer(dtype);
            let y = kernel.apply(&ones(1, 64, dtype), &codes, &codebooks, &scales, None).unwrap();
            assert_eq!(y.to_f32_vec().unwrap(), scenario_expected());
        }
    }

    #[test]
    fn test_apply_checks_codebooks_against_config() {
        let kernel = select_with(&registry(), &accel(2, 256, 1, 4)).unwrap();
        let (codes, codebooks, scales) = scenario_layer(DType::F16);
        let err = kernel
            .apply(&ones(1, 64, DType::F16), &codes, &codebooks, &scales, None)
            .unwrap_err();
        assert!(matches!(err, AqlmError::ShapeMismatch { tensor: "codebooks", .. }));
        assert!(format!("{kernel:?}").contains("tiled"));
    }

    #[test]
    fn test_apply_rejects_input_group_scales() {
        let registry = registry();
        let (codes, codebooks, _) = scenario_layer(DType::F16);
        // 16 output groups, 8 input groups
        let swapped = Tensor::from_f32_as(vec![1, 8, 1, 1], vec![1.0; 8], DType::F16).unwrap();
        for config in [accel(2, 256, 1, 8), host(2, 256, 1, 8)] {
            let kernel = select_with(&registry, &config).unwrap();
            let err = kernel
                .apply(&ones(1, 64, DType::F16), &codes, &codebooks, &swapped, None)
                .unwrap_err();
            assert!(
                matches!(err, AqlmError::ShapeMismatch { tensor: "scales", .. }),
                "{}: {err}",
                kernel.name()
            );
        }
    }
}
