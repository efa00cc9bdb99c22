use std::fmt;

use half::{bf16, f16};
use smallvec::SmallVec;

use crate::device::Device;
use crate::dtype::{DType, Element};
use crate::error::TesselError;
use crate::float8::F8E4M3;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A strided multi-dimensional view over shared storage.
///
/// This is the operand type of every dispatch entry point. Kernels only
/// accept contiguous tensors; `transpose` exists so callers (and tests) can
/// produce the non-contiguous views validation must reject.
///
/// # Examples
///
/// ```
/// use tessel_core::{DType, Tensor};
///
/// let t = Tensor::from_f32_as(&[1.0, 2.0, 3.0, 4.0], &[2, 2], DType::BF16).unwrap();
/// assert_eq!(t.dtype(), DType::BF16);
/// assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
///
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.shape().dims(), &[4]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
    offset: usize,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a contiguous tensor holding a copy of `data`.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(TesselError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self::from_storage(Storage::from_slice(data), s))
    }

    /// Create an F32 tensor.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_storage(Storage::from_f32(data), s)
    }

    /// Convert f32 values into `dtype` (rounding to nearest, saturating for
    /// float8, truncating for integers).
    pub fn from_f32_as(data: &[f32], shape: &[usize], dtype: DType) -> Result<Self> {
        fn convert<T: Element>(data: &[f32], shape: &[usize]) -> Result<Tensor> {
            let values: Vec<T> = data.iter().map(|&v| T::from_f32(v)).collect();
            Tensor::from_slice(&values, shape)
        }
        match dtype {
            DType::F32 => Self::from_slice(data, shape),
            DType::BF16 => convert::<bf16>(data, shape),
            DType::F16 => convert::<f16>(data, shape),
            DType::F8E4M3 => convert::<F8E4M3>(data, shape),
            DType::I32 => convert::<i32>(data, shape),
            DType::I64 => convert::<i64>(data, shape),
            DType::U8 => convert::<u8>(data, shape),
        }
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::zeros(dtype, s.numel()), s)
    }

    /// Wrap pre-built storage with a contiguous layout.
    pub fn from_storage(storage: Storage, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        Self {
            storage,
            shape,
            strides,
            offset: 0,
        }
    }

    /// Same data, tagged as resident on `device`.
    pub fn to_device(&self, device: Device) -> Tensor {
        Tensor {
            storage: self.storage.clone().with_device(device),
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Strides (in elements, not bytes).
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Whether this tensor is contiguous in memory (row-major, no offset).
    pub fn is_contiguous(&self) -> bool {
        self.strides == self.shape.contiguous_strides() && self.offset == 0
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Typed view of a contiguous tensor.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if !self.is_contiguous() {
            return Err(TesselError::NonContiguous);
        }
        self.storage.as_slice::<T>()
    }

    /// Mutable typed view of a contiguous tensor (copy-on-write).
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        if !self.is_contiguous() {
            return Err(TesselError::NonContiguous);
        }
        self.storage.as_slice_mut::<T>()
    }

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.as_slice::<f32>().ok()
    }

    /// Decode every element to f32 in logical (row-major) order.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype() {
            DType::F32 => self.gather::<f32>(),
            DType::BF16 => self.gather::<bf16>(),
            DType::F16 => self.gather::<f16>(),
            DType::F8E4M3 => self.gather::<F8E4M3>(),
            DType::I32 => self.gather::<i32>(),
            DType::I64 => self.gather::<i64>(),
            DType::U8 => self.gather::<u8>(),
        }
    }

    /// Read an integer index tensor (I32 or I64) as i64 values.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        let t = self.contiguous()?;
        match t.dtype() {
            DType::I32 => Ok(t.as_slice::<i32>()?.iter().map(|&v| v as i64).collect()),
            DType::I64 => Ok(t.as_slice::<i64>()?.to_vec()),
            other => Err(TesselError::UnsupportedDType(other)),
        }
    }

    fn gather<T: Element>(&self) -> Result<Vec<f32>> {
        let data = self.storage.as_slice::<T>()?;
        if self.is_contiguous() {
            return Ok(data.iter().map(|&v| v.to_f32()).collect());
        }
        Ok(self
            .physical_indices()
            .into_iter()
            .map(|p| data[p].to_f32())
            .collect())
    }

    /// Physical index of every logical element, in row-major order.
    fn physical_indices(&self) -> Vec<usize> {
        let numel = self.numel();
        let dims = self.shape.dims();
        let mut out = Vec::with_capacity(numel);
        let mut idx: SmallVec<[usize; 4]> = SmallVec::from_elem(0, dims.len());
        let mut physical = self.offset;
        for _ in 0..numel {
            out.push(physical);
            for axis in (0..dims.len()).rev() {
                idx[axis] += 1;
                physical += self.strides[axis];
                if idx[axis] < dims[axis] {
                    break;
                }
                physical -= self.strides[axis] * dims[axis];
                idx[axis] = 0;
            }
        }
        out
    }

    // =========================================================================
    // Shape operations (zero-copy views)
    // =========================================================================

    /// Reshape a contiguous tensor (zero-copy).
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self.shape.resolve_reshape(new_shape).ok_or_else(|| {
            TesselError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.to_vec(),
            }
        })?;

        if !self.is_contiguous() {
            return Err(TesselError::NonContiguous);
        }

        let strides = resolved.contiguous_strides();
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: resolved,
            strides,
            offset: self.offset,
        })
    }

    /// Transpose the last two dimensions (zero-copy view).
    pub fn transpose(&self) -> Result<Tensor> {
        let new_shape = self.shape.transpose().ok_or(TesselError::InvalidAxis {
            axis: 1,
            ndim: self.ndim(),
        })?;

        let ndim = self.ndim();
        let mut new_strides = self.strides.clone();
        new_strides.swap(ndim - 2, ndim - 1);

        Ok(Tensor {
            storage: self.storage.clone(),
            shape: new_shape,
            strides: new_strides,
            offset: self.offset,
        })
    }

    /// Return a contiguous copy of this tensor if it isn't already contiguous.
    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let es = self.dtype().element_size();
        let src = self.storage.as_bytes();
        let mut storage = Storage::zeros(self.dtype(), self.numel()).with_device(self.device());
        let dst = storage.as_bytes_mut();
        for (i, p) in self.physical_indices().into_iter().enumerate() {
            let from = src.get(p * es..(p + 1) * es).ok_or_else(|| {
                TesselError::StorageError(format!("view element {p} is outside its storage"))
            })?;
            dst[i * es..(i + 1) * es].copy_from_slice(from);
        }
        Ok(Tensor::from_storage(storage, self.shape.clone()))
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, contiguous={})",
            self.shape,
            self.dtype(),
            self.device(),
            self.is_contiguous(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_f32_vec() {
            Ok(data) if data.len() <= 20 => {
                write!(f, "tensor({:?}, shape={}, dtype={})", data, self.shape, self.dtype())
            }
            Ok(data) => write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={}, dtype={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape,
                self.dtype()
            ),
            Err(_) => write!(f, "tensor(shape={}, dtype={})", self.shape, self.dtype()),
        }
    }
}
