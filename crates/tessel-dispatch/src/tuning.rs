//! Opt-in measured selection.
//!
//! On a table miss the dispatcher may time every kernel that supports the
//! live shape and remember the fastest under a power-of-two rounded key.
//! Measurement runs outside the lock; when two callers race on one key both
//! measure and the first insertion wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tessel_kernels::{GemmKernel, KernelError};
use tracing::{debug, info};

use crate::config::DispatchConfig;
use crate::key::ProblemShape;
use crate::operator::Operator;

/// Times repeated executions of one kernel.
pub trait KernelTimer: Send + Sync {
    /// `run` performs one complete launch on the live operands.
    fn time(
        &self,
        kernel: &dyn GemmKernel,
        run: &mut dyn FnMut() -> Result<(), KernelError>,
    ) -> Result<Duration, KernelError>;
}

/// Mean wall-clock time after warm-up launches.
#[derive(Debug, Clone, Copy)]
pub struct WallClockTimer {
    pub warmup: usize,
    pub iters: usize,
}

impl Default for WallClockTimer {
    fn default() -> Self {
        Self { warmup: 1, iters: 3 }
    }
}

impl KernelTimer for WallClockTimer {
    fn time(
        &self,
        _kernel: &dyn GemmKernel,
        run: &mut dyn FnMut() -> Result<(), KernelError>,
    ) -> Result<Duration, KernelError> {
        for _ in 0..self.warmup {
            run()?;
        }
        let iters = self.iters.max(1);
        let start = Instant::now();
        for _ in 0..iters {
            run()?;
        }
        Ok(start.elapsed() / iters as u32)
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningStats {
    pub hits: u64,
    pub misses: u64,
    /// Tuning passes (one per miss that found candidates).
    pub measurements: u64,
    /// Individual kernel timings across all passes.
    pub kernels_timed: u64,
}

type TuningKey = (Operator, [usize; 4]);

pub struct TuningCache {
    entries: RwLock<HashMap<TuningKey, Arc<dyn GemmKernel>>>,
    timer: Box<dyn KernelTimer>,
    hits: AtomicU64,
    misses: AtomicU64,
    measurements: AtomicU64,
    kernels_timed: AtomicU64,
}

impl TuningCache {
    pub fn new() -> Self {
        Self::with_timer(WallClockTimer::default())
    }

    /// Wall-clock timing with the configured warm-up and repetitions.
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::with_timer(WallClockTimer {
            warmup: config.tuning_warmup,
            iters: config.tuning_iters,
        })
    }

    pub fn with_timer(timer: impl KernelTimer + 'static) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timer: Box::new(timer),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            measurements: AtomicU64::new(0),
            kernels_timed: AtomicU64::new(0),
        }
    }

    /// Stored winner for a shape, without touching the counters.
    pub fn get(&self, op: Operator, shape: &ProblemShape) -> Option<Arc<dyn GemmKernel>> {
        self.entries.read().get(&(op, shape.tuning_key())).cloned()
    }

    /// Return the stored winner, or time `candidates` (in catalog order) and
    /// store the fastest. Ties go to the earlier candidate. `None` only when
    /// nothing is stored and `candidates` is empty.
    pub fn get_or_tune<F>(
        &self,
        op: Operator,
        shape: &ProblemShape,
        candidates: &[Arc<dyn GemmKernel>],
        mut run: F,
    ) -> Result<Option<Arc<dyn GemmKernel>>, KernelError>
    where
        F: FnMut(&dyn GemmKernel) -> Result<(), KernelError>,
    {
        let key = (op, shape.tuning_key());
        if let Some(kernel) = self.entries.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(kernel.clone()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        if candidates.is_empty() {
            return Ok(None);
        }

        info!(op = %op, shape = %shape, candidates = candidates.len(), "tuning (synchronizes)");
        self.measurements.fetch_add(1, Ordering::Relaxed);
        let mut best: Option<(Duration, &Arc<dyn GemmKernel>)> = None;
        for kernel in candidates {
            let elapsed = self.timer.time(kernel.as_ref(), &mut || run(kernel.as_ref()))?;
            self.kernels_timed.fetch_add(1, Ordering::Relaxed);
            debug!(kernel = kernel.name(), ?elapsed, "timed");
            if best.map_or(true, |(t, _)| elapsed < t) {
                best = Some((elapsed, kernel));
            }
        }
        let Some((elapsed, winner)) = best else {
            return Ok(None);
        };

        let stored = self.entries.write().entry(key).or_insert_with(|| winner.clone()).clone();
        if stored.name() == winner.name() {
            info!(op = %op, key = ?key.1, kernel = winner.name(), ?elapsed, "tuned");
        } else {
            debug!(op = %op, key = ?key.1, kept = stored.name(), "concurrent tuning result discarded");
        }
        Ok(Some(stored))
    }

    pub fn stats(&self) -> TuningStats {
        TuningStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            measurements: self.measurements.load(Ordering::Relaxed),
            kernels_timed: self.kernels_timed.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for TuningCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TuningCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TuningCache")
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_kernels::KernelCatalog;

    /// Reports a fixed duration per kernel name without running anything.
    struct FakeTimer(Vec<(String, u64)>);

    impl KernelTimer for FakeTimer {
        fn time(
            &self,
            kernel: &dyn GemmKernel,
            _run: &mut dyn FnMut() -> Result<(), KernelError>,
        ) -> Result<Duration, KernelError> {
            let micros = self
                .0
                .iter()
                .find(|(n, _)| n == kernel.name())
                .map_or(1000, |(_, t)| *t);
            Ok(Duration::from_micros(micros))
        }
    }

    fn candidates() -> Vec<Arc<dyn GemmKernel>> {
        KernelCatalog::bf16().unwrap().kernels()[..4].to_vec()
    }

    #[test]
    fn test_fastest_wins_and_is_cached() {
        let c = candidates();
        let fast = c[2].name().to_string();
        let cache = TuningCache::with_timer(FakeTimer(vec![(fast.clone(), 5)]));
        let shape = ProblemShape::new(100, 512, 512);

        let k = cache.get_or_tune(Operator::Bf16, &shape, &c, |_| Ok(())).unwrap().unwrap();
        assert_eq!(k.name(), fast);
        assert_eq!(cache.stats().measurements, 1);
        assert_eq!(cache.stats().kernels_timed, 4);

        // 120 rounds to the same key as 100.
        let again = ProblemShape::new(120, 512, 512);
        let k = cache.get_or_tune(Operator::Bf16, &again, &c, |_| Ok(())).unwrap().unwrap();
        assert_eq!(k.name(), fast);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.measurements), (1, 1, 1));
    }

    #[test]
    fn test_ties_go_to_catalog_order() {
        let c = candidates();
        let cache = TuningCache::with_timer(FakeTimer(vec![]));
        let k = cache
            .get_or_tune(Operator::Bf16, &ProblemShape::new(8, 8, 8), &c, |_| Ok(()))
            .unwrap()
            .unwrap();
        assert_eq!(k.name(), c[0].name());
    }

    #[test]
    fn test_operator_is_part_of_key() {
        let c = candidates();
        let cache = TuningCache::with_timer(FakeTimer(vec![]));
        let shape = ProblemShape::new(8, 8, 8);
        cache.get_or_tune(Operator::Bf16, &shape, &c, |_| Ok(())).unwrap();
        assert!(cache.get(Operator::Bf16, &shape).is_some());
        assert!(cache.get(Operator::Bf16Grouped, &shape).is_none());
    }

    #[test]
    fn test_run_failure_propagates_and_stores_nothing() {
        let c = candidates();
        let cache = TuningCache::new();
        let err = cache
            .get_or_tune(Operator::Bf16, &ProblemShape::new(8, 8, 8), &c, |_| {
                Err(KernelError::DimensionOverflow(1))
            })
            .unwrap_err();
        assert_eq!(err, KernelError::DimensionOverflow(1));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_wall_clock_runs_warmup_and_iters() {
        let timer = WallClockTimer { warmup: 2, iters: 3 };
        let c = candidates();
        let mut calls = 0;
        timer
            .time(c[0].as_ref(), &mut || {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_from_config_uses_configured_timing() {
        let config = DispatchConfig {
            tuning_warmup: 0,
            tuning_iters: 2,
            ..Default::default()
        };
        let cache = TuningCache::from_config(&config);
        let c = candidates();
        let mut calls = 0;
        cache
            .get_or_tune(Operator::Bf16, &ProblemShape::new(8, 8, 8), &c[..1], |_| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_first_writer_wins_across_threads() {
        let c = candidates();
        let cache = Arc::new(TuningCache::with_timer(FakeTimer(vec![])));
        let shape = ProblemShape::new(64, 64, 64);
        let winners: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cache = cache.clone();
                    let c = c.clone();
                    s.spawn(move || {
                        cache
                            .get_or_tune(Operator::Bf16, &shape, &c, |_| Ok(()))
                            .unwrap()
                            .unwrap()
                            .name()
                            .to_string()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(winners.iter().all(|w| w == &winners[0]));
        assert_eq!(cache.len(), 1);
    }
}
