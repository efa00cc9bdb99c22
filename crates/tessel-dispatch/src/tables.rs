//! Shape-keyed lookup tables.
//!
//! Two tables per operator: an exact table keyed by `(G, bucket(M), N, K)`
//! and family tables keyed by `(G, N, K)` holding an ordered M → kernel map.
//! Both are plain data ([`TableSpec`]) until resolved against a catalog.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessel_kernels::{GemmKernel, KernelCatalog};

use crate::error::{DispatchError, Result};
use crate::key::{is_bucket, ExactKey, FamilyKey, ProblemShape};

fn one() -> usize {
    1
}

/// Serializable description of one operator's tables.
///
/// Kernel names are either full catalog names or the configuration part
/// alone, which is resolved under the catalog prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(default)]
    pub exact: Vec<ExactEntry>,
    #[serde(default)]
    pub families: Vec<FamilySpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactEntry {
    #[serde(default = "one")]
    pub groups: usize,
    /// Must be an M bucket (16, 32, 64, 128) or larger than 128.
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub kernel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySpec {
    #[serde(default = "one")]
    pub groups: usize,
    pub n: usize,
    pub k: usize,
    pub entries: Vec<FamilyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyEntry {
    pub m: usize,
    pub kernel: String,
}

impl TableSpec {
    pub fn exact(mut self, m: usize, n: usize, k: usize, kernel: &str) -> Self {
        self.exact.push(ExactEntry {
            groups: 1,
            m,
            n,
            k,
            kernel: kernel.to_string(),
        });
        self
    }

    pub fn family(mut self, n: usize, k: usize, entries: &[(usize, &str)]) -> Self {
        self.families.push(FamilySpec {
            groups: 1,
            n,
            k,
            entries: entries
                .iter()
                .map(|&(m, kernel)| FamilyEntry {
                    m,
                    kernel: kernel.to_string(),
                })
                .collect(),
        });
        self
    }

    /// Move every entry to `groups` (grouped operators key on G too).
    pub fn with_groups(mut self, groups: usize) -> Self {
        for e in &mut self.exact {
            e.groups = groups;
        }
        for f in &mut self.families {
            f.groups = groups;
        }
        self
    }
}

/// Read a JSON object mapping operator names to table specs.
pub fn load_table_file(path: &Path) -> Result<BTreeMap<String, TableSpec>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DispatchError::Table(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| DispatchError::Table(format!("{}: {e}", path.display())))
}

/// Which table answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableHit {
    Exact,
    Family,
}

/// Immutable lookup tables resolved against one catalog.
#[derive(Debug, Clone, Default)]
pub struct ShapeTables {
    exact: HashMap<ExactKey, Arc<dyn GemmKernel>>,
    families: HashMap<FamilyKey, BTreeMap<usize, Arc<dyn GemmKernel>>>,
}

impl ShapeTables {
    /// Resolve kernel names and reject duplicate keys.
    pub fn build(spec: &TableSpec, catalog: &KernelCatalog) -> Result<Self> {
        let mut tables = Self::default();

        for e in &spec.exact {
            if e.groups == 0 || e.m == 0 || e.n == 0 || e.k == 0 {
                return Err(DispatchError::Table(format!(
                    "exact entry {}g:{}x{}x{} has a zero dimension",
                    e.groups, e.m, e.n, e.k
                )));
            }
            if !is_bucket(e.m) {
                return Err(DispatchError::Table(format!(
                    "exact entry M={} is not an M bucket and can never match",
                    e.m
                )));
            }
            let key = ExactKey {
                groups: e.groups,
                m: e.m,
                n: e.n,
                k: e.k,
            };
            let kernel = resolve(catalog, &e.kernel)?;
            if tables.exact.insert(key, kernel).is_some() {
                return Err(DispatchError::Table(format!("duplicate exact key {key:?}")));
            }
        }

        for f in &spec.families {
            let key = FamilyKey {
                groups: f.groups,
                n: f.n,
                k: f.k,
            };
            if f.entries.is_empty() {
                return Err(DispatchError::Table(format!("family {key:?} has no entries")));
            }
            let mut map = BTreeMap::new();
            for entry in &f.entries {
                if entry.m == 0 {
                    return Err(DispatchError::Table(format!("family {key:?} has an M=0 entry")));
                }
                if map.insert(entry.m, resolve(catalog, &entry.kernel)?).is_some() {
                    return Err(DispatchError::Table(format!(
                        "family {key:?} lists M={} twice",
                        entry.m
                    )));
                }
            }
            if tables.families.insert(key, map).is_some() {
                return Err(DispatchError::Table(format!("duplicate family key {key:?}")));
            }
        }

        Ok(tables)
    }

    pub fn lookup_exact(&self, shape: &ProblemShape) -> Option<&Arc<dyn GemmKernel>> {
        self.exact.get(&shape.exact_key())
    }

    /// First entry with key ≥ M; past the end, the largest entry.
    pub fn lookup_family(&self, shape: &ProblemShape) -> Option<&Arc<dyn GemmKernel>> {
        let map = self.families.get(&shape.family_key())?;
        map.range(shape.m..)
            .next()
            .or_else(|| map.iter().next_back())
            .map(|(_, kernel)| kernel)
    }

    /// Exact table first, then the family table.
    pub fn lookup(&self, shape: &ProblemShape) -> Option<(TableHit, &Arc<dyn GemmKernel>)> {
        self.lookup_exact(shape)
            .map(|k| (TableHit::Exact, k))
            .or_else(|| self.lookup_family(shape).map(|k| (TableHit::Family, k)))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.families.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.families.is_empty()
    }
}

fn resolve(catalog: &KernelCatalog, name: &str) -> Result<Arc<dyn GemmKernel>> {
    catalog.resolve(name).cloned().ok_or_else(|| {
        DispatchError::Table(format!("kernel '{name}' is not in catalog '{}'", catalog.name()))
    })
}
