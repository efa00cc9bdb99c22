//! Per-group kernel argument records.
//!
//! A record is the host model of a device argument struct: element offsets
//! stand in for base pointers. The buffer is built fresh for every call and
//! its byte image is exactly what would be copied to the device.

use bytemuck::{Pod, Zeroable};

use crate::error::{KernelError, Result};

/// One GEMM problem inside a (possibly grouped) launch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelArgumentRecord {
    pub a_offset: u64,
    pub b_offset: u64,
    pub a_scale_offset: u64,
    pub b_scale_offset: u64,
    pub c_offset: u64,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub lda: u32,
    pub ldb: u32,
    pub ldc: u32,
    pub group: u32,
    /// Non-zero when the result is added to the output instead of stored.
    pub accumulate: u32,
}

/// A rectangle of the output the kernel must zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ZeroFill {
    pub offset: u64,
    pub rows: u32,
    pub cols: u32,
    pub ld: u32,
    pub _reserved: u32,
}

/// Checked narrowing for 32-bit argument fields.
pub fn arg_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| KernelError::DimensionOverflow(value))
}

impl KernelArgumentRecord {
    /// Record for a single row-major problem `C[m,n] = A[m,k] * B[n,k]^T`.
    pub fn dense(m: usize, n: usize, k: usize) -> Result<Self> {
        Ok(Self {
            m: arg_u32(m)?,
            n: arg_u32(n)?,
            k: arg_u32(k)?,
            lda: arg_u32(k)?,
            ldb: arg_u32(k)?,
            ldc: arg_u32(n)?,
            ..Self::default()
        })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.m as usize, self.n as usize, self.k as usize)
    }

    pub fn accumulates(&self) -> bool {
        self.accumulate != 0
    }
}

impl ZeroFill {
    pub fn new(offset: usize, rows: usize, cols: usize, ld: usize) -> Result<Self> {
        Ok(Self {
            offset: offset as u64,
            rows: arg_u32(rows)?,
            cols: arg_u32(cols)?,
            ld: arg_u32(ld)?,
            _reserved: 0,
        })
    }
}

/// Contiguous argument buffer handed to a kernel launch.
#[derive(Debug, Clone, Default)]
pub struct KernelArgBuffer {
    records: Vec<KernelArgumentRecord>,
    zero_fills: Vec<ZeroFill>,
}

impl KernelArgBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(groups: usize) -> Self {
        Self {
            records: Vec::with_capacity(groups),
            zero_fills: Vec::new(),
        }
    }

    /// Buffer holding one record.
    pub fn single(record: KernelArgumentRecord) -> Self {
        Self {
            records: vec![record],
            zero_fills: Vec::new(),
        }
    }

    pub fn from_parts(records: Vec<KernelArgumentRecord>, zero_fills: Vec<ZeroFill>) -> Self {
        Self { records, zero_fills }
    }

    pub fn push(&mut self, record: KernelArgumentRecord) {
        self.records.push(record);
    }

    pub fn push_zero_fill(&mut self, fill: ZeroFill) {
        self.zero_fills.push(fill);
    }

    pub fn records(&self) -> &[KernelArgumentRecord] {
        &self.records
    }

    pub fn zero_fills(&self) -> &[ZeroFill] {
        &self.zero_fills
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Raw byte image of the record array.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        assert_eq!(std::mem::size_of::<KernelArgumentRecord>(), 72);
        assert_eq!(std::mem::size_of::<ZeroFill>(), 24);
    }

    #[test]
    fn test_dense_record() {
        let r = KernelArgumentRecord::dense(128, 64, 256).unwrap();
        assert_eq!(r.dims(), (128, 64, 256));
        assert_eq!((r.lda, r.ldb, r.ldc), (256, 256, 64));
        assert!(!r.accumulates());
    }

    #[test]
    fn test_byte_image() {
        let mut buf = KernelArgBuffer::with_capacity(2);
        buf.push(KernelArgumentRecord::dense(1, 2, 3).unwrap());
        buf.push(KernelArgumentRecord {
            group: 1,
            ..KernelArgumentRecord::dense(4, 5, 6).unwrap()
        });
        let bytes = buf.as_bytes();
        assert_eq!(bytes.len(), 2 * 72);
        let back: &[KernelArgumentRecord] = bytemuck::cast_slice(bytes);
        assert_eq!(back[1].group, 1);
        assert_eq!(back[1].dims(), (4, 5, 6));
    }

    #[test]
    fn test_overflow_is_reported() {
        let big = u32::MAX as usize + 1;
        assert_eq!(arg_u32(big), Err(KernelError::DimensionOverflow(big)));
    }
}
