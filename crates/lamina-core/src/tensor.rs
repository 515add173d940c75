use std::fmt;

use crate::dtype::DType;
use crate::device::Device;
use crate::error::LaminaError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A contiguous multi-dimensional array — the value exchanged between stages.
///
/// Tensors are row-major and always contiguous; `clone` shares storage,
/// [`Tensor::deep_clone`] copies it. The `requires_grad` flag is the only
/// autograd-adjacent state this crate carries: the pipeline uses it as the
/// "upstream gradient exists" signal and to mark auxiliary wire slots
/// non-differentiable.
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    device: Device,
    requires_grad: bool,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
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
        Self {
            storage: Storage::F32(data.to_vec().into()),
            shape: s,
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    /// Create a tensor from i32 data with the given shape.
    pub fn from_i32(data: &[i32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        Self {
            storage: Storage::I32(data.to_vec().into()),
            shape: s,
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    /// Create a tensor from i64 data with the given shape.
    pub fn from_i64(data: &[i64], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        Self {
            storage: Storage::I64(data.to_vec().into()),
            shape: s,
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    /// Create a tensor from bool data with the given shape.
    pub fn from_bool(data: &[bool], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        Self {
            storage: Storage::Bool(data.to_vec().into()),
            shape: s,
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self {
            storage: Storage::zeros(dtype, s.numel()),
            shape: s,
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    /// Create an all-true boolean tensor (the "no padding" mask).
    pub fn ones_bool(shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        Self {
            storage: Storage::Bool(vec![true; s.numel()].into()),
            shape: s,
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    /// Create a tensor with values drawn from N(0, std²).
    pub fn randn(shape: &[usize], std: f32) -> Self {
        use rand::Rng;
        let s = Shape::new(shape);
        let numel = s.numel();
        let mut rng = rand::thread_rng();
        // Box-Muller transform for normal distribution
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos() * std
            })
            .collect();
        Self::from_f32(&data, shape)
    }

    /// Create a scalar f32 tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            storage: Storage::F32(vec![value].into()),
            shape: Shape::scalar(),
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Device this tensor logically lives on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Tag the tensor with a device (data stays host-side in this core).
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Whether this tensor participates in gradient computation.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Set whether this tensor participates in gradient computation.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// A view of this tensor with gradient tracking severed.
    ///
    /// Shares storage with `self`; only the flag differs. Decoded auxiliary
    /// envelope slots (masks, position ids, bias) are detached on arrival.
    pub fn detach(&self) -> Tensor {
        let mut t = self.clone();
        t.requires_grad = false;
        t
    }

    /// Copy this tensor into storage shared with nobody.
    ///
    /// Re-encoded auxiliary slots must be deep-cloned so a later in-place
    /// mutation on one stage cannot corrupt a tensor another stage retained.
    pub fn deep_clone(&self) -> Tensor {
        Tensor {
            storage: self.storage.deep_copy(),
            shape: self.shape.clone(),
            device: self.device,
            requires_grad: self.requires_grad,
        }
    }

    /// Whether two tensors share the same underlying buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    // =========================================================================
    // Data access
    // =========================================================================

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.storage.as_f32()
    }

    pub fn as_i32_slice(&self) -> Option<&[i32]> {
        self.storage.as_i32()
    }

    pub fn as_i64_slice(&self) -> Option<&[i64]> {
        self.storage.as_i64()
    }

    pub fn as_bool_slice(&self) -> Option<&[bool]> {
        self.storage.as_bool()
    }

    /// Mutable f32 access (copy-on-write when the buffer is shared).
    pub fn as_f32_slice_mut(&mut self) -> Option<&mut [f32]> {
        self.storage.as_f32_mut()
    }

    // =========================================================================
    // Shape operations
    // =========================================================================

    /// Reshape the tensor (cheap: storage is shared, only the shape changes).
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self.shape.resolve_reshape(new_shape).ok_or_else(|| {
            LaminaError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.to_vec(),
            }
        })?;
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: resolved,
            device: self.device,
            requires_grad: self.requires_grad,
        })
    }

    /// Cast a float mask to boolean (non-zero ⇒ true).
    ///
    /// Only defined for F32 and Bool sources; the restricted backend needs
    /// its prepared attention mask in boolean form.
    pub fn to_bool(&self) -> Result<Tensor> {
        match self.dtype() {
            DType::Bool => Ok(self.clone()),
            DType::F32 => {
                let data = self.as_f32_slice().ok_or(LaminaError::UnsupportedDType(DType::F32))?;
                let bools: Vec<bool> = data.iter().map(|&v| v != 0.0).collect();
                Ok(Tensor::from_bool(&bools, self.shape.dims()).to_device(self.device))
            }
            other => Err(LaminaError::UnsupportedDType(other)),
        }
    }

    /// Element-wise equality of values (same dtype, shape, and contents).
    pub fn value_eq(&self, other: &Tensor) -> bool {
        if self.shape != *other.shape() || self.dtype() != other.dtype() {
            return false;
        }
        match (&self.storage, &other.storage) {
            (Storage::F32(a), Storage::F32(b)) => a == b,
            (Storage::I32(a), Storage::I32(b)) => a == b,
            (Storage::I64(a), Storage::I64(b)) => a == b,
            (Storage::Bool(a), Storage::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, requires_grad={})",
            self.shape,
            self.dtype(),
            self.device,
            self.requires_grad,
        )
    }
}
