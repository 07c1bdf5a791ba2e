use crate::dtype::DType;
use crate::error::{AqlmError, Result};
use half::{bf16, f16};
use std::fmt;

/// Typed, contiguous, row-major backing buffer of a [`Tensor`].
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

/// Apply the same generic expression to whichever typed vector a storage
/// holds, rebuilding a storage of the same variant.
macro_rules! map_storage {
    ($storage:expr, |$v:ident| $body:expr) => {
        match $storage {
            Storage::F32($v) => Storage::F32($body),
            Storage::F16($v) => Storage::F16($body),
            Storage::BF16($v) => Storage::BF16($body),
            Storage::U8($v) => Storage::U8($body),
            Storage::I8($v) => Storage::I8($body),
            Storage::U16($v) => Storage::U16($body),
            Storage::I16($v) => Storage::I16($body),
            Storage::I32($v) => Storage::I32($body),
        }
    };
}

impl Storage {
    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
            Storage::U8(_) => DType::U8,
            Storage::I8(_) => DType::I8,
            Storage::U16(_) => DType::U16,
            Storage::I16(_) => DType::I16,
            Storage::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F16(v) => v.len(),
            Storage::BF16(v) => v.len(),
            Storage::U8(v) => v.len(),
            Storage::I8(v) => v.len(),
            Storage::U16(v) => v.len(),
            Storage::I16(v) => v.len(),
            Storage::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scalar types that can back a [`Storage`].
pub trait StorageElement: bytemuck::Pod + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    fn slice(storage: &Storage) -> Option<&[Self]>;
    fn into_storage(data: Vec<Self>) -> Storage;
}

/// Floating-point storage types. Arithmetic happens in `f32`; `from_f32`
/// rounds to the storage precision.
pub trait Element: StorageElement + Default + PartialEq {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

macro_rules! impl_storage_element {
    ($ty:ty, $variant:ident) => {
        impl StorageElement for $ty {
            const DTYPE: DType = DType::$variant;

            #[inline]
            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }
        }
    };
}

impl_storage_element!(f32, F32);
impl_storage_element!(f16, F16);
impl_storage_element!(bf16, BF16);
impl_storage_element!(u8, U8);
impl_storage_element!(i8, I8);
impl_storage_element!(u16, U16);
impl_storage_element!(i16, I16);
impl_storage_element!(i32, I32);

impl Element for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl Element for bf16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

/// Dense row-major tensor. Immutable once built; kernels only borrow it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    storage: Storage,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, storage: Storage) -> Result<Self> {
        let n = num_elements(&shape)?;
        if n != storage.len() {
            return Err(AqlmError::InvalidInput(format!(
                "shape {shape:?} holds {n} elements but storage has {}",
                storage.len()
            )));
        }
        Ok(Self { shape, storage })
    }

    pub fn from_vec<T: StorageElement>(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        Self::new(shape, T::into_storage(data))
    }

    /// Build a float tensor of `dtype` from `f32` values, rounding as needed.
    pub fn from_f32_as(shape: Vec<usize>, data: Vec<f32>, dtype: DType) -> Result<Self> {
        let storage = match dtype {
            DType::F32 => Storage::F32(data),
            DType::F16 => Storage::F16(data.into_iter().map(f16::from_f32).collect()),
            DType::BF16 => Storage::BF16(data.into_iter().map(bf16::from_f32).collect()),
            other => {
                return Err(AqlmError::DTypeMismatch {
                    tensor: "tensor",
                    expected: "a float dtype".into(),
                    got: other,
                });
            }
        };
        Self::new(shape, storage)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn num_elements(&self) -> usize {
        self.storage.len()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Typed view; fails if the tensor is stored as another dtype.
    pub fn as_slice<T: StorageElement>(&self) -> Result<&[T]> {
        T::slice(&self.storage).ok_or(AqlmError::DTypeMismatch {
            tensor: "tensor",
            expected: T::DTYPE.to_string(),
            got: self.dtype(),
        })
    }

    /// Widen a float tensor to `f32` values.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match &self.storage {
            Storage::F32(v) => Ok(v.clone()),
            Storage::F16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            Storage::BF16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            _ => Err(AqlmError::DTypeMismatch {
                tensor: "tensor",
                expected: "a float dtype".into(),
                got: self.dtype(),
            }),
        }
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor> {
        Self::new(shape, self.storage.clone())
    }

    /// Swap two axes, materializing a contiguous result.
    pub fn transpose(&self, a: usize, b: usize) -> Result<Tensor> {
        let rank = self.rank();
        if a >= rank || b >= rank {
            return Err(AqlmError::InvalidInput(format!(
                "cannot transpose axes ({a}, {b}) of a rank-{rank} tensor"
            )));
        }
        let mut shape = self.shape.clone();
        shape.swap(a, b);
        if a == b {
            return Ok(self.clone());
        }
        let src_shape = &self.shape;
        let storage = map_storage!(&self.storage, |v| transpose_vec(v, src_shape, a, b));
        Ok(Tensor { shape, storage })
    }
}

fn transpose_vec<T: Copy>(data: &[T], shape: &[usize], a: usize, b: usize) -> Vec<T> {
    let rank = shape.len();
    let mut strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }

    let mut out_shape = shape.to_vec();
    out_shape.swap(a, b);
    strides.swap(a, b);

    let mut out = Vec::with_capacity(data.len());
    let mut idx = vec![0usize; rank];
    for _ in 0..data.len() {
        let src: usize = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(data[src]);
        for d in (0..rank).rev() {
            idx[d] += 1;
            if idx[d] < out_shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

/// Element count with overflow detection.
pub fn num_elements(shape: &[usize]) -> Result<usize> {
    let mut n: usize = 1;
    for &dim in shape {
        n = n.checked_mul(dim).ok_or_else(|| {
            AqlmError::InvalidInput(format!(
                "shape overflow: dimension {dim} in {shape:?} overflows usize"
            ))
        })?;
    }
    Ok(n)
}

/// Allocate `len` copies of `value`, reporting exhaustion as a resource
/// error instead of aborting.
pub fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| {
        AqlmError::Resource(format!(
            "failed to allocate {len} elements of {} bytes: {e}",
            std::mem::size_of::<T>()
        ))
    })?;
    v.resize(len, value);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_element_count() {
        assert!(Tensor::from_vec(vec![2, 3], vec![0.0f32; 6]).is_ok());
        assert!(Tensor::from_vec(vec![2, 3], vec![0.0f32; 5]).is_err());
    }

    #[test]
    fn test_shape_overflow() {
        assert!(num_elements(&[usize::MAX, 2]).is_err());
    }

    #[test]
    fn test_typed_access_rejects_wrong_dtype() {
        let t = Tensor::from_vec(vec![2], vec![1i16, -1]).unwrap();
        assert_eq!(t.as_slice::<i16>().unwrap(), &[1, -1]);
        assert!(t.as_slice::<u16>().is_err());
        assert!(t.to_f32_vec().is_err());
    }

    #[test]
    fn test_transpose_2d() {
        let t = Tensor::from_vec(vec![2, 3], vec![0i32, 1, 2, 3, 4, 5]).unwrap();
        let tt = t.transpose(0, 1).unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert_eq!(tt.as_slice::<i32>().unwrap(), &[0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_transpose_inner_axes_of_4d() {
        // [1, 1, 2, 3] -> [1, 1, 3, 2]
        let t = Tensor::from_vec(vec![1, 1, 2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let tt = t.transpose(2, 3).unwrap();
        assert_eq!(tt.shape(), &[1, 1, 3, 2]);
        assert_eq!(
            tt.as_slice::<f32>().unwrap(),
            &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
        assert_eq!(tt.transpose(2, 3).unwrap(), t);
    }

    #[test]
    fn test_transpose_moves_unit_axis() {
        let t = Tensor::from_vec(vec![3, 1, 1, 1], vec![1.0f32, 2.0, 3.0]).unwrap();
        let tt = t.transpose(0, 1).unwrap();
        assert_eq!(tt.shape(), &[1, 3, 1, 1]);
        assert_eq!(tt.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_f16_conversion() {
        let t = Tensor::from_f32_as(vec![3], vec![1.0, -0.5, 0.1], DType::F16).unwrap();
        assert_eq!(t.dtype(), DType::F16);
        let back = t.to_f32_vec().unwrap();
        assert_eq!(back[0], 1.0);
        assert_eq!(back[1], -0.5);
        assert!((back[2] - 0.1).abs() < 1e-3);
        assert!(Tensor::from_f32_as(vec![1], vec![1.0], DType::I8).is_err());
    }

    #[test]
    fn test_try_filled() {
        let v = try_filled(4, 0.5f32).unwrap();
        assert_eq!(v, vec![0.5; 4]);
        let e = try_filled::<f32>(usize::MAX / 2, 0.0).unwrap_err();
        assert_eq!(e.kind(), crate::error::ErrorKind::Resource);
    }
}
