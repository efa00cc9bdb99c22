//! The per-operator selection chain: tables, then tuning, then heuristic.

use std::fmt;
use std::sync::Arc;

use tessel_kernels::{GemmKernel, KernelCatalog, KernelError};
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};
use crate::heuristic::{Heuristic, HeuristicPath, HeuristicRules};
use crate::key::ProblemShape;
use crate::operator::Operator;
use crate::tables::{ShapeTables, TableHit, TableSpec};
use crate::tuning::TuningCache;

/// Which stage produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ExactTable,
    FamilyTable,
    Tuned,
    Heuristic,
    /// Heuristic routed a misaligned shape to the safe kernel.
    AlignmentGuard,
    /// The heuristic's kernel could not serve every group.
    SafeFallback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::ExactTable => "exact-table",
            Stage::FamilyTable => "family-table",
            Stage::Tuned => "tuned",
            Stage::Heuristic => "heuristic",
            Stage::AlignmentGuard => "alignment-guard",
            Stage::SafeFallback => "safe-fallback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub kernel: Arc<dyn GemmKernel>,
    pub stage: Stage,
}

/// Launches one candidate on the live operands.
pub type RunCandidate<'a> = &'a mut dyn FnMut(&dyn GemmKernel) -> std::result::Result<(), KernelError>;

/// Catalog, tables and heuristic of one operator.
#[derive(Debug, Clone)]
pub struct OperatorDispatch {
    op: Operator,
    catalog: KernelCatalog,
    tables: ShapeTables,
    heuristic: Heuristic,
}

fn supports_all(kernel: &dyn GemmKernel, dims: &[(usize, usize, usize)]) -> bool {
    dims.iter().all(|&(m, n, k)| kernel.supports(m, n, k))
}

impl OperatorDispatch {
    pub fn new(
        op: Operator,
        catalog: KernelCatalog,
        tables: &TableSpec,
        rules: &HeuristicRules,
    ) -> Result<Self> {
        Ok(Self {
            op,
            tables: ShapeTables::build(tables, &catalog)?,
            heuristic: Heuristic::build(rules, &catalog)?,
            catalog,
        })
    }

    /// Built-in catalog, preset tables and preset rules.
    pub fn builtin(op: Operator) -> Result<Self> {
        let catalog = op.catalog().map_err(|e| DispatchError::Config(e.to_string()))?;
        Self::new(op, catalog, &op.preset_tables(), &op.preset_rules())
    }

    /// Same operator with tables replaced.
    pub fn with_tables(mut self, spec: &TableSpec) -> Result<Self> {
        self.tables = ShapeTables::build(spec, &self.catalog)?;
        Ok(self)
    }

    pub fn operator(&self) -> Operator {
        self.op
    }

    pub fn catalog(&self) -> &KernelCatalog {
        &self.catalog
    }

    pub fn tables(&self) -> &ShapeTables {
        &self.tables
    }

    pub fn heuristic(&self) -> &Heuristic {
        &self.heuristic
    }

    /// Select a kernel for `shape` whose groups have the extents in `dims`
    /// (all positive). With `tuning`, a table miss is measured through
    /// `run`; otherwise the heuristic answers.
    pub fn select(
        &self,
        shape: &ProblemShape,
        dims: &[(usize, usize, usize)],
        tuning: Option<(&TuningCache, RunCandidate<'_>)>,
    ) -> Result<Selection> {
        if let Some((hit, kernel)) = self.tables.lookup(shape) {
            if supports_all(kernel.as_ref(), dims) {
                let stage = match hit {
                    TableHit::Exact => Stage::ExactTable,
                    TableHit::Family => Stage::FamilyTable,
                };
                return Ok(Selection {
                    kernel: kernel.clone(),
                    stage,
                });
            }
            warn!(
                op = %self.op,
                shape = %shape,
                kernel = kernel.name(),
                "table entry cannot serve shape, falling through"
            );
        }

        if let Some((cache, run)) = tuning {
            let candidates: Vec<_> = self
                .catalog
                .kernels()
                .iter()
                .filter(|k| supports_all(k.as_ref(), dims))
                .cloned()
                .collect();
            let tuned = cache.get_or_tune(self.op, shape, &candidates, |k| run(k))?;
            match tuned {
                Some(kernel) if supports_all(kernel.as_ref(), dims) => {
                    return Ok(Selection {
                        kernel,
                        stage: Stage::Tuned,
                    });
                }
                Some(kernel) => debug!(
                    kernel = kernel.name(),
                    "tuned kernel for rounded key cannot serve shape"
                ),
                None => {}
            }
        }

        Ok(self.select_heuristic(shape, dims))
    }

    fn select_heuristic(&self, shape: &ProblemShape, dims: &[(usize, usize, usize)]) -> Selection {
        let (kernel, path) = self.heuristic.select(shape.m, shape.n, shape.k);
        if !supports_all(kernel.as_ref(), dims) {
            return Selection {
                kernel: self.heuristic.safe_kernel().clone(),
                stage: Stage::SafeFallback,
            };
        }
        let stage = match path {
            HeuristicPath::AlignmentGuard => Stage::AlignmentGuard,
            HeuristicPath::SafeFallback => Stage::SafeFallback,
            HeuristicPath::Rule(_) | HeuristicPath::Default => Stage::Heuristic,
        };
        Selection { kernel, stage }
    }
}
