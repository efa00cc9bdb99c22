//! Index remapping for pruned tables.
//!
//! A pruned table keeps only some of its original rows. Lookups first map
//! sparse (original) row ids to dense (kept) row ids, either through a
//! per-table open-addressing hash map or a per-table dense array. `-1`
//! marks a pruned row; tables with no remapping pass ids through.

use tessel_core::{DType, Device, Tensor};
use tracing::debug;

use super::{bag_offsets, index_values};
use crate::error::{invalid, Result};
use crate::validate;

const EMPTY: i64 = -1;

/// 32-bit murmur3 finalizer.
pub fn murmur_hash32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// 64-bit murmur3 finalizer.
pub fn murmur_hash64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Hash of a sparse id at the width of its index dtype.
fn slot_hash(idx: i64, dtype: DType) -> u64 {
    match dtype {
        DType::I32 => murmur_hash32(idx as i32 as u32) as u64,
        _ => murmur_hash64(idx as u64),
    }
}

/// Per-table ranges of a remap buffer with `len` slots.
fn table_ranges(name: &str, offsets: &Tensor, len: usize) -> Result<Vec<(usize, usize)>> {
    let raw = validate::descriptor(name, offsets, DType::I64)?;
    if raw.len() < 2 {
        return invalid!("{name} must have at least 2 entries");
    }
    raw.windows(2)
        .enumerate()
        .map(|(t, w)| match (usize::try_from(w[0]), usize::try_from(w[1])) {
            (Ok(s), Ok(e)) if s <= e && e <= len => Ok((s, e)),
            _ => invalid!("{name}: table {t} range {}..{} is outside 0..{len}", w[0], w[1]),
        })
        .collect()
}

/// Index positions `(table, start, end)` of every table's bags.
fn table_segments(
    indices: &Tensor,
    offsets: &Tensor,
    tables: usize,
    len: usize,
) -> Result<Vec<(usize, usize, usize)>> {
    if offsets.dtype() != indices.dtype() {
        return invalid!("indices are {} but offsets are {}", indices.dtype(), offsets.dtype());
    }
    let (batch, offs) = bag_offsets(&index_values("offsets", offsets)?, tables, len)?;
    Ok((0..tables)
        .map(|t| (t, offs[t * batch], offs[(t + 1) * batch]))
        .collect())
}

fn to_index_tensor(values: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
    let t = match dtype {
        DType::I32 => {
            let narrow = values
                .iter()
                .map(|&v| i32::try_from(v))
                .collect::<std::result::Result<Vec<_>, _>>()
                .or_else(|_| invalid!("remapped id does not fit in i32"))?;
            Tensor::from_slice(&narrow, &[values.len()])?
        }
        _ => Tensor::from_slice(values, &[values.len()])?,
    };
    Ok(t.to_device(device))
}

/// Hash table tensor `[C, 2]` of (sparse id, dense id) pairs.
fn hash_slots(hash_table: &Tensor) -> Result<Vec<i64>> {
    if !matches!(hash_table.dtype(), DType::I32 | DType::I64) {
        return invalid!("hash_table must be i32 or i64, got {}", hash_table.dtype());
    }
    validate::contiguous("hash_table", hash_table)?;
    if hash_table.ndim() != 2 || hash_table.dims()[1] != 2 {
        return invalid!("hash_table must have shape [C, 2], got {}", hash_table.shape());
    }
    Ok(hash_table.to_i64_vec()?)
}

/// Insert `indices[p] → dense_indices[p]` for every index position into the
/// hash map of its table. Rows already marked pruned (`-1`) are skipped, an
/// existing key is overwritten. Tables with no slots are skipped.
pub fn pruned_hashmap_insert(
    indices: &Tensor,
    dense_indices: &Tensor,
    offsets: &Tensor,
    hash_table: &mut Tensor,
    hash_table_offsets: &Tensor,
) -> Result<()> {
    validate::same_device(&[
        ("indices", indices),
        ("dense_indices", dense_indices),
        ("offsets", offsets),
        ("hash_table", &*hash_table),
        ("hash_table_offsets", hash_table_offsets),
    ])?;
    let ids = index_values("indices", indices)?;
    let dense = index_values("dense_indices", dense_indices)?;
    if dense.len() != ids.len() {
        return invalid!("{} dense ids for {} indices", dense.len(), ids.len());
    }
    let mut slots = hash_slots(hash_table)?;
    let capacity_total = slots.len() / 2;
    let ranges = table_ranges("hash_table_offsets", hash_table_offsets, capacity_total)?;
    let segments = table_segments(indices, offsets, ranges.len(), ids.len())?;

    let mut inserted = 0usize;
    for (t, start, end) in segments {
        let (table_start, table_end) = ranges[t];
        let capacity = table_end - table_start;
        if capacity == 0 {
            continue;
        }
        for p in start..end {
            let (idx, dense_idx) = (ids[p], dense[p]);
            if dense_idx == EMPTY {
                continue;
            }
            let mut slot = (slot_hash(idx, indices.dtype()) % capacity as u64) as usize;
            let mut placed = false;
            for _ in 0..capacity {
                let at = 2 * (table_start + slot);
                if slots[at] == EMPTY || slots[at] == idx {
                    slots[at] = idx;
                    slots[at + 1] = dense_idx;
                    placed = true;
                    break;
                }
                slot = (slot + 1) % capacity;
            }
            if !placed {
                return invalid!("hash table of table {t} is full ({capacity} slots)");
            }
            inserted += 1;
        }
    }

    match hash_table.dtype() {
        DType::I32 => {
            let narrow = slots
                .iter()
                .map(|&v| i32::try_from(v))
                .collect::<std::result::Result<Vec<_>, _>>()
                .or_else(|_| invalid!("id does not fit an i32 hash table"))?;
            hash_table.as_slice_mut::<i32>()?.copy_from_slice(&narrow);
        }
        _ => hash_table.as_slice_mut::<i64>()?.copy_from_slice(&slots),
    }
    debug!(inserted, "pruned hash map insert");
    Ok(())
}

/// Map every index to its dense id (`-1` when pruned). Output has the dtype
/// and length of `indices`.
pub fn pruned_hashmap_lookup(
    indices: &Tensor,
    offsets: &Tensor,
    hash_table: &Tensor,
    hash_table_offsets: &Tensor,
) -> Result<Tensor> {
    let device = validate::same_device(&[
        ("indices", indices),
        ("offsets", offsets),
        ("hash_table", hash_table),
        ("hash_table_offsets", hash_table_offsets),
    ])?;
    let ids = index_values("indices", indices)?;
    let slots = hash_slots(hash_table)?;
    let ranges = table_ranges("hash_table_offsets", hash_table_offsets, slots.len() / 2)?;
    let segments = table_segments(indices, offsets, ranges.len(), ids.len())?;

    let mut dense = ids.clone();
    for (t, start, end) in segments {
        let (table_start, table_end) = ranges[t];
        let capacity = table_end - table_start;
        if capacity == 0 {
            continue;
        }
        for p in start..end {
            let idx = ids[p];
            let mut slot = (slot_hash(idx, indices.dtype()) % capacity as u64) as usize;
            dense[p] = EMPTY;
            for _ in 0..capacity {
                let at = 2 * (table_start + slot);
                if slots[at] == EMPTY {
                    break;
                }
                if slots[at] == idx {
                    dense[p] = slots[at + 1];
                    break;
                }
                slot = (slot + 1) % capacity;
            }
        }
    }
    to_index_tensor(&dense, indices.dtype(), device)
}

/// Map every index through its table's dense remap array
/// `index_remappings[start_t + idx]`. Tables with an empty range pass ids
/// through; ids outside a non-empty range are rejected.
pub fn pruned_array_lookup(
    indices: &Tensor,
    offsets: &Tensor,
    index_remappings: &Tensor,
    index_remappings_offsets: &Tensor,
) -> Result<Tensor> {
    let device = validate::same_device(&[
        ("indices", indices),
        ("offsets", offsets),
        ("index_remappings", index_remappings),
        ("index_remappings_offsets", index_remappings_offsets),
    ])?;
    let ids = index_values("indices", indices)?;
    let remap = index_values("index_remappings", index_remappings)?;
    let ranges = table_ranges("index_remappings_offsets", index_remappings_offsets, remap.len())?;
    let segments = table_segments(indices, offsets, ranges.len(), ids.len())?;

    let mut dense = ids.clone();
    for (t, start, end) in segments {
        let (table_start, table_end) = ranges[t];
        let capacity = table_end - table_start;
        if capacity == 0 {
            continue;
        }
        for p in start..end {
            dense[p] = match usize::try_from(ids[p]) {
                Ok(i) if i < capacity => remap[table_start + i],
                _ => {
                    return invalid!(
                        "index {} out of range for table {t} with {capacity} rows",
                        ids[p]
                    )
                }
            };
        }
    }
    to_index_tensor(&dense, indices.dtype(), device)
}
