use std::sync::Arc;

use crate::dtype::DType;

/// Typed backing storage for tensor data.
///
/// Storage is reference-counted so tensors can be cloned cheaply when an
/// envelope forwards them unchanged; [`Storage::deep_copy`] produces a
/// private buffer for the clone-before-forward rule.
#[derive(Debug, Clone)]
pub enum Storage {
    F32(Arc<Vec<f32>>),
    I32(Arc<Vec<i32>>),
    I64(Arc<Vec<i64>>),
    Bool(Arc<Vec<bool>>),
}

impl Storage {
    /// Allocate zeroed storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::F32 => Storage::F32(Arc::new(vec![0.0; numel])),
            DType::I32 => Storage::I32(Arc::new(vec![0; numel])),
            DType::I64 => Storage::I64(Arc::new(vec![0; numel])),
            DType::Bool => Storage::Bool(Arc::new(vec![false; numel])),
        }
    }

    /// Data type of the stored elements.
    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
            Storage::Bool(_) => DType::Bool,
        }
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::I32(v) => v.len(),
            Storage::I64(v) => v.len(),
            Storage::Bool(v) => v.len(),
        }
    }

    /// Copy the underlying buffer so the result shares nothing with `self`.
    pub fn deep_copy(&self) -> Self {
        match self {
            Storage::F32(v) => Storage::F32(Arc::new(v.as_ref().clone())),
            Storage::I32(v) => Storage::I32(Arc::new(v.as_ref().clone())),
            Storage::I64(v) => Storage::I64(Arc::new(v.as_ref().clone())),
            Storage::Bool(v) => Storage::Bool(Arc::new(v.as_ref().clone())),
        }
    }

    /// Whether two storages share the same underlying buffer.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        match (self, other) {
            (Storage::F32(a), Storage::F32(b)) => Arc::ptr_eq(a, b),
            (Storage::I32(a), Storage::I32(b)) => Arc::ptr_eq(a, b),
            (Storage::I64(a), Storage::I64(b)) => Arc::ptr_eq(a, b),
            (Storage::Bool(a), Storage::Bool(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Storage::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Storage::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Storage::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            Storage::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable access to f32 data, copy-on-write when shared.
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            Storage::F32(v) => Some(Arc::make_mut(v).as_mut_slice()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(DType::F32, 4);
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.numel(), 4);
        assert!(s.as_f32().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_deep_copy_is_private() {
        let a = Storage::F32(Arc::new(vec![1.0, 2.0]));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        let c = a.deep_copy();
        assert!(!a.ptr_eq(&c));
        assert_eq!(c.as_f32().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_typed_access() {
        let s = Storage::I64(Arc::new(vec![7, 8]));
        assert_eq!(s.as_i64().unwrap(), &[7, 8]);
        assert!(s.as_f32().is_none());
        assert_eq!(s.dtype(), DType::I64);
    }

    #[test]
    fn test_copy_on_write() {
        let mut a = Storage::F32(Arc::new(vec![1.0, 2.0]));
        let b = a.clone();
        a.as_f32_mut().unwrap()[0] = 9.0;
        assert_eq!(a.as_f32().unwrap()[0], 9.0);
        assert_eq!(b.as_f32().unwrap()[0], 1.0);
    }
}
