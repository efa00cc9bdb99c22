//! Eager operand checks shared by every entry point.

use tessel_core::{DType, Device, Tensor};

use crate::error::{invalid, Result};

pub(crate) fn dtype(name: &str, t: &Tensor, expected: DType) -> Result<()> {
    if t.dtype() != expected {
        return invalid!("{name} must be {expected}, got {}", t.dtype());
    }
    Ok(())
}

pub(crate) fn contiguous(name: &str, t: &Tensor) -> Result<()> {
    if !t.is_contiguous() {
        return invalid!("{name} must be contiguous");
    }
    Ok(())
}

pub(crate) fn rank(name: &str, t: &Tensor, ranks: &[usize]) -> Result<()> {
    if !ranks.contains(&t.ndim()) {
        return invalid!("{name} must have rank {ranks:?}, got shape {}", t.shape());
    }
    Ok(())
}

/// All tensors must share one device; returns it.
pub(crate) fn same_device(tensors: &[(&str, &Tensor)]) -> Result<Device> {
    let Some((first_name, first)) = tensors.first() else {
        return Ok(Device::Cpu);
    };
    let device = first.device();
    for (name, t) in &tensors[1..] {
        if t.device() != device {
            return invalid!(
                "{name} is on {} but {first_name} is on {device}",
                t.device()
            );
        }
    }
    Ok(device)
}

/// Contiguous and of the given dtype.
pub(crate) fn operand(name: &str, t: &Tensor, expected: DType) -> Result<()> {
    dtype(name, t, expected)?;
    contiguous(name, t)
}

/// A per-row scale vector: F32, contiguous, `len` elements, rank 1 or a
/// trailing unit dimension.
pub(crate) fn scale(name: &str, t: &Tensor, len: usize) -> Result<()> {
    scale_shaped(name, t, len, false)
}

/// Like [`scale`], but a per-group `[G, n]` block is accepted too.
pub(crate) fn grouped_scale(name: &str, t: &Tensor, len: usize) -> Result<()> {
    scale_shaped(name, t, len, true)
}

fn scale_shaped(name: &str, t: &Tensor, len: usize, per_group: bool) -> Result<()> {
    operand(name, t, DType::F32)?;
    let shaped = match t.dims() {
        [n] | [n, 1] => *n == len,
        [g, n] if per_group => g * n == len,
        _ => false,
    };
    if !shaped {
        return invalid!("{name} must hold {len} scales, got shape {}", t.shape());
    }
    Ok(())
}

/// A caller-supplied output must match exactly.
pub(crate) fn output(out: &Tensor, dims: &[usize], device: Device) -> Result<()> {
    if out.dims() != dims {
        return invalid!("out must have shape {dims:?}, got {}", out.shape());
    }
    operand("out", out, DType::BF16)?;
    if out.device() != device {
        return invalid!("out is on {} but operands are on {device}", out.device());
    }
    Ok(())
}

/// Integer descriptor tensor of rank 1.
pub(crate) fn descriptor(name: &str, t: &Tensor, expected: DType) -> Result<Vec<i64>> {
    operand(name, t, expected)?;
    rank(name, t, &[1])?;
    Ok(t.to_i64_vec()?)
}
