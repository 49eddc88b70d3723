//! Dense row-major tensor.
//!
//! Values are stored as `f32`; the [`DType`] tag records which element type
//! the values represent. Casting to a narrower type rounds every value, so a
//! tensor tagged [`DType::F16`] only ever holds values representable in half
//! precision.

use std::fmt;

use half::{bf16, f16};

/// Element type carried by a [`Tensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    /// 32-bit float
    #[default]
    F32,
    /// 16-bit float (IEEE 754 half-precision)
    F16,
    /// Brain float 16
    BF16,
}

impl DType {
    /// Round a value to the nearest value representable in this type.
    #[inline]
    #[must_use]
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::F32 => value,
            Self::F16 => f16::from_f32(value).to_f32(),
            Self::BF16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// Bytes per element when persisted.
    #[must_use]
    pub fn bytes_per_element(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// SafeTensors dtype name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
        }
    }
}

/// A dense tensor with a shape and element-type tag.
///
/// # Design
///
/// The tensor stores:
/// - `data`: the numerical values, row-major
/// - `shape`: dimensions of the tensor
/// - `dtype`: element type the values represent
/// - `requires_grad`: whether this tensor would participate in gradient
///   computation; frozen parameters always report `false`
#[derive(Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
    dtype: DType,
    requires_grad: bool,
}

impl Tensor {
    /// Create a new tensor from a slice with the given shape.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the product of shape dimensions.
    #[must_use]
    pub fn new(data: &[f32], shape: &[usize]) -> Self {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Create a tensor taking ownership of `data`.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the product of shape dimensions.
    #[must_use]
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_len
        );

        Self {
            data,
            shape: shape.to_vec(),
            dtype: DType::F32,
            requires_grad: false,
        }
    }

    /// Create a tensor from a 1D slice (vector).
    #[must_use]
    pub fn from_slice(data: &[f32]) -> Self {
        Self::new(data, &[data.len()])
    }

    /// Create a tensor filled with `value`.
    #[must_use]
    pub fn full(shape: &[usize], value: f32) -> Self {
        let len: usize = shape.iter().product();
        Self::from_vec(vec![value; len], shape)
    }

    /// Create a tensor filled with zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with ones.
    #[must_use]
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Enable gradient tracking for this tensor.
    #[must_use]
    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    /// Enable or disable gradient tracking (in-place).
    pub fn requires_grad_(&mut self, requires: bool) -> &mut Self {
        self.requires_grad = requires;
        self
    }

    /// Check if this tensor requires gradient computation.
    #[must_use]
    pub fn requires_grad_enabled(&self) -> bool {
        self.requires_grad
    }

    /// Get the shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Get the number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Element type of the stored values.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get a reference to the underlying data.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Split a 4D shape into `(N, C, H, W)`.
    ///
    /// # Panics
    ///
    /// Panics if the tensor is not 4D.
    #[must_use]
    pub fn dims4(&self) -> (usize, usize, usize, usize) {
        assert_eq!(
            self.ndim(),
            4,
            "expected 4D tensor [N, C, H, W], got shape {:?}",
            self.shape
        );
        (self.shape[0], self.shape[1], self.shape[2], self.shape[3])
    }

    /// Trailing two dimensions `(H, W)`.
    ///
    /// # Panics
    ///
    /// Panics if the tensor has fewer than two dimensions.
    #[must_use]
    pub fn spatial_size(&self) -> (usize, usize) {
        let n = self.ndim();
        assert!(n >= 2, "tensor of shape {:?} has no spatial dims", self.shape);
        (self.shape[n - 2], self.shape[n - 1])
    }

    /// Cast to another element type, rounding every value.
    #[must_use]
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        let mut out = self.clone();
        out.cast_(dtype);
        out
    }

    /// Cast in place.
    pub fn cast_(&mut self, dtype: DType) {
        if dtype != DType::F32 {
            for v in &mut self.data {
                *v = dtype.round(*v);
            }
        }
        self.dtype = dtype;
    }

    /// Apply `f` elementwise, keeping shape and element type.
    #[must_use]
    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Tensor {
        let dtype = self.dtype;
        let data = self.data.iter().map(|&v| dtype.round(f(v))).collect();
        Tensor {
            data,
            shape: self.shape.clone(),
            dtype,
            requires_grad: false,
        }
    }

    /// Elementwise sum.
    ///
    /// # Panics
    ///
    /// Panics if shapes differ.
    #[must_use]
    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.shape, other.shape,
            "add: shape {:?} != {:?}",
            self.shape, other.shape
        );
        let dtype = self.dtype;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| dtype.round(a + b))
            .collect();
        Tensor {
            data,
            shape: self.shape.clone(),
            dtype,
            requires_grad: false,
        }
    }

    /// Rectified linear unit.
    #[must_use]
    pub fn relu(&self) -> Tensor {
        self.map(|v| v.max(0.0))
    }

    /// True when every value is finite.
    #[must_use]
    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("requires_grad", &self.requires_grad)
            .finish_non_exhaustive()
    }
}
