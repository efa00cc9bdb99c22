use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessel_kernels::{KernelCatalog, KernelError};

use crate::heuristic::HeuristicRules;
use crate::presets;
use crate::tables::TableSpec;

/// Operator families the dispatcher serves. Each owns one catalog, one set
/// of tables and one heuristic; its name keys the tuning cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Fp8Rowwise,
    Bf16,
    Fp8Grouped,
    Bf16Grouped,
}

impl Operator {
    pub const ALL: [Operator; 4] = [
        Operator::Fp8Rowwise,
        Operator::Bf16,
        Operator::Fp8Grouped,
        Operator::Bf16Grouped,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Fp8Rowwise => "fp8_rowwise",
            Operator::Bf16 => "bf16",
            Operator::Fp8Grouped => "fp8_grouped",
            Operator::Bf16Grouped => "bf16_grouped",
        }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self, Operator::Fp8Grouped | Operator::Bf16Grouped)
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self, Operator::Fp8Rowwise | Operator::Fp8Grouped)
    }

    /// The built-in catalog of this operator.
    pub fn catalog(&self) -> Result<KernelCatalog, KernelError> {
        match self {
            Operator::Fp8Rowwise => KernelCatalog::fp8_rowwise(),
            Operator::Bf16 => KernelCatalog::bf16(),
            Operator::Fp8Grouped => KernelCatalog::fp8_grouped(),
            Operator::Bf16Grouped => KernelCatalog::bf16_grouped(),
        }
    }

    pub fn preset_tables(&self) -> TableSpec {
        match self {
            Operator::Fp8Rowwise => presets::fp8_rowwise_tables(),
            Operator::Bf16 => presets::bf16_tables(),
            Operator::Fp8Grouped => presets::fp8_grouped_tables(),
            Operator::Bf16Grouped => presets::bf16_grouped_tables(),
        }
    }

    pub fn preset_rules(&self) -> HeuristicRules {
        match self {
            Operator::Fp8Rowwise => presets::fp8_rowwise_rules(),
            Operator::Bf16 => presets::bf16_rules(),
            Operator::Fp8Grouped => presets::fp8_grouped_rules(),
            Operator::Bf16Grouped => presets::bf16_grouped_rules(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .iter()
            .copied()
            .find(|op| op.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Operator::ALL.iter().map(|op| op.name()).collect();
                format!("unknown operator '{s}', expected one of {}", names.join(", "))
            })
    }
}
