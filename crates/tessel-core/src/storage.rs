use std::sync::Arc;

use crate::{DType, Device, Element, Result, TesselError};

/// Host byte buffer backed by 8-byte words so any element type can be
/// viewed in place.
#[derive(Debug, Clone)]
struct Buffer {
    words: Vec<u64>,
    nbytes: usize,
}

impl Buffer {
    fn zeroed(nbytes: usize) -> Self {
        Self {
            words: vec![0u64; nbytes.div_ceil(8)],
            nbytes,
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.nbytes]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.nbytes]
    }
}

/// Shared, reference-counted tensor storage.
///
/// Views produced by reshape/transpose share one buffer; mutation goes
/// through copy-on-write.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<Buffer>,
    dtype: DType,
    device: Device,
    /// Number of logical elements (not bytes).
    numel: usize,
}

impl Storage {
    /// Allocate zeroed host storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self {
            data: Arc::new(Buffer::zeroed(dtype.storage_bytes(numel))),
            dtype,
            device: Device::Cpu,
            numel,
        }
    }

    /// Create storage from raw little-endian bytes.
    pub fn from_bytes(dtype: DType, numel: usize, bytes: &[u8]) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(TesselError::StorageError(format!(
                "expected {} bytes for {} elements of {}, got {}",
                expected,
                numel,
                dtype,
                bytes.len()
            )));
        }
        let mut storage = Self::zeros(dtype, numel);
        storage.as_bytes_mut().copy_from_slice(bytes);
        Ok(storage)
    }

    /// Create storage holding a copy of `data`.
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        let mut storage = Self::zeros(T::DTYPE, data.len());
        storage
            .as_bytes_mut()
            .copy_from_slice(bytemuck::cast_slice(data));
        storage
    }

    pub fn from_f32(data: &[f32]) -> Self {
        Self::from_slice(data)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Re-tag residency. Bytes stay in host memory.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.nbytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    /// Mutable bytes. Clones the buffer if other views share it.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).bytes_mut()
    }

    /// Interpret storage as a typed slice.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype::<T>()?;
        bytemuck::try_cast_slice(self.as_bytes())
            .map_err(|e| TesselError::StorageError(format!("cast to {}: {e}", T::DTYPE)))
    }

    /// Interpret storage as a mutable typed slice (copy-on-write).
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_dtype::<T>()?;
        bytemuck::try_cast_slice_mut(self.as_bytes_mut())
            .map_err(|e| TesselError::StorageError(format!("cast to {}: {e}", T::DTYPE)))
    }

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.as_slice::<f32>().ok()
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if self.dtype != T::DTYPE {
            return Err(TesselError::DTypeMismatch {
                expected: T::DTYPE,
                got: self.dtype,
            });
        }
        Ok(())
    }
}
