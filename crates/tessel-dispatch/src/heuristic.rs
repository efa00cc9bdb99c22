//! Rule-based kernel choice for shapes the tables do not cover.
//!
//! Rules are upper bounds on `(M, N, K)` tried in order; the first rule a
//! shape fits picks the kernel, otherwise the default does. Because every
//! rule only bounds from above, a componentwise larger shape can never match
//! an earlier rule than a smaller one, so ordering rules by growing tile
//! size makes the selection grow with the problem.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessel_kernels::{GemmKernel, KernelCatalog};

use crate::error::{DispatchError, Result};

/// One range rule. Absent bounds match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_m: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_k: Option<usize>,
    pub kernel: String,
}

impl RangeRule {
    pub fn m(max_m: usize, kernel: &str) -> Self {
        Self {
            max_m: Some(max_m),
            max_n: None,
            max_k: None,
            kernel: kernel.to_string(),
        }
    }

    pub fn mn(max_m: usize, max_n: usize, kernel: &str) -> Self {
        Self {
            max_n: Some(max_n),
            ..Self::m(max_m, kernel)
        }
    }

    pub fn mnk(max_m: usize, max_n: usize, max_k: usize, kernel: &str) -> Self {
        Self {
            max_m: Some(max_m),
            max_n: Some(max_n),
            max_k: Some(max_k),
            kernel: kernel.to_string(),
        }
    }

    fn matches(&self, m: usize, n: usize, k: usize) -> bool {
        self.max_m.map_or(true, |b| m <= b)
            && self.max_n.map_or(true, |b| n <= b)
            && self.max_k.map_or(true, |b| k <= b)
    }
}

/// Serializable heuristic configuration for one operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicRules {
    pub rules: Vec<RangeRule>,
    pub default: String,
}

/// How the heuristic arrived at its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicPath {
    /// N or K breaks the catalog vector width.
    AlignmentGuard,
    Rule(usize),
    Default,
    /// The chosen kernel could not serve the shape.
    SafeFallback,
}

/// Rules resolved against a catalog.
#[derive(Debug, Clone)]
pub struct Heuristic {
    vector_width: usize,
    safe: Arc<dyn GemmKernel>,
    rules: Vec<(RangeRule, Arc<dyn GemmKernel>)>,
    default: Arc<dyn GemmKernel>,
}

impl Heuristic {
    pub fn build(rules: &HeuristicRules, catalog: &KernelCatalog) -> Result<Self> {
        let resolve = |name: &str| {
            catalog.resolve(name).cloned().ok_or_else(|| {
                DispatchError::Config(format!(
                    "heuristic kernel '{name}' is not in catalog '{}'",
                    catalog.name()
                ))
            })
        };
        let resolved = rules
            .rules
            .iter()
            .map(|r| Ok((r.clone(), resolve(&r.kernel)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vector_width: catalog.vector_width(),
            safe: catalog.safe_kernel().clone(),
            rules: resolved,
            default: resolve(&rules.default)?,
        })
    }

    /// Pick a kernel for a positive shape. Total: the returned kernel always
    /// supports `(m, n, k)`.
    pub fn select(&self, m: usize, n: usize, k: usize) -> (Arc<dyn GemmKernel>, HeuristicPath) {
        if n % self.vector_width != 0 || k % self.vector_width != 0 {
            return (self.safe.clone(), HeuristicPath::AlignmentGuard);
        }
        let (kernel, path) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, (rule, _))| rule.matches(m, n, k))
            .map(|(i, (_, kernel))| (kernel, HeuristicPath::Rule(i)))
            .unwrap_or((&self.default, HeuristicPath::Default));
        if kernel.supports(m, n, k) {
            (kernel.clone(), path)
        } else {
            (self.safe.clone(), HeuristicPath::SafeFallback)
        }
    }

    pub fn safe_kernel(&self) -> &Arc<dyn GemmKernel> {
        &self.safe
    }
}
