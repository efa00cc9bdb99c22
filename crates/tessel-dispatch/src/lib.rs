//! # tessel-dispatch
//!
//! Shape-driven kernel selection and the public GEMM and embedding entry
//! points of the tessel engine.
//!
//! Provides:
//! - `ShapeTables`: exact `(M, N, K)` and per-`(N, K)` family lookups into a
//!   kernel catalog
//! - `Heuristic`: ordered range rules with an alignment guard, total over
//!   all positive shapes
//! - `TuningCache`: measure-once kernel choice keyed by rounded shape
//! - `build_args`: per-group argument records for grouped and ragged GEMM
//! - `Dispatcher`: the validated GEMM facade (`gemm_bf16`,
//!   `f8f8bf16_rowwise`, `grouped_gemm`)
//! - `embedding`: table-batched pooled lookup, pruned index remapping and
//!   in-place row update
//!
//! ```ignore
//! use tessel_dispatch::{Dispatcher, DispatchConfig};
//!
//! let dispatcher = Dispatcher::new(DispatchConfig::from_env())?;
//! let y = dispatcher.gemm_bf16(&a, &b, None)?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod embedding;
pub mod error;
pub mod grouped;
pub mod heuristic;
pub mod key;
pub mod operator;
pub mod presets;
pub mod select;
pub mod tables;
pub mod tuning;
mod validate;

pub use config::{DispatchConfig, ZeroingMode};
pub use dispatcher::{Dispatcher, GroupedGemmArgs};
pub use error::{DispatchError, Result};
pub use grouped::{build_args, GroupLayout, GroupedArgs, RaggedDim};
pub use heuristic::{Heuristic, HeuristicPath, HeuristicRules, RangeRule};
pub use key::ProblemShape;
pub use operator::Operator;
pub use select::{OperatorDispatch, RunCandidate, Selection, Stage};
pub use tables::{ShapeTables, TableHit, TableSpec};
pub use tuning::{KernelTimer, TuningCache, TuningStats, WallClockTimer};
