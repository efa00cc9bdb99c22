//! Problem shapes and the keys derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// M buckets of the exact table. M above the last bucket is used unchanged.
pub const M_BUCKETS: [usize; 4] = [16, 32, 64, 128];

/// Logical size of one dispatch. `groups` is 1 for a plain GEMM. For grouped
/// dispatch the ragged axis holds its total across groups and the other two
/// axes are per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemShape {
    pub groups: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl ProblemShape {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { groups: 1, m, n, k }
    }

    pub fn grouped(groups: usize, m: usize, n: usize, k: usize) -> Self {
        Self { groups, m, n, k }
    }

    pub fn has_zero_dim(&self) -> bool {
        self.groups == 0 || self.m == 0 || self.n == 0 || self.k == 0
    }

    pub fn exact_key(&self) -> ExactKey {
        ExactKey {
            groups: self.groups,
            m: bucket_m(self.m),
            n: self.n,
            k: self.k,
        }
    }

    pub fn family_key(&self) -> FamilyKey {
        FamilyKey {
            groups: self.groups,
            n: self.n,
            k: self.k,
        }
    }

    /// Every dimension rounded up to a power of two.
    pub fn tuning_key(&self) -> [usize; 4] {
        [
            next_pow2(self.groups),
            next_pow2(self.m),
            next_pow2(self.n),
            next_pow2(self.k),
        ]
    }
}

impl fmt::Display for ProblemShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.groups == 1 {
            write!(f, "{}x{}x{}", self.m, self.n, self.k)
        } else {
            write!(f, "{}g:{}x{}x{}", self.groups, self.m, self.n, self.k)
        }
    }
}

/// Key of the exact table: M already bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExactKey {
    pub groups: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Key of a family table; M is resolved inside the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FamilyKey {
    pub groups: usize,
    pub n: usize,
    pub k: usize,
}

/// Round M up to the nearest bucket.
pub fn bucket_m(m: usize) -> usize {
    M_BUCKETS.iter().copied().find(|&b| m <= b).unwrap_or(m)
}

/// Whether `m` is a value `bucket_m` can produce.
pub fn is_bucket(m: usize) -> bool {
    m > M_BUCKETS[M_BUCKETS.len() - 1] || M_BUCKETS.contains(&m)
}

pub fn next_pow2(x: usize) -> usize {
    x.max(1).next_power_of_two()
}
