//! # lamina-core
//!
//! Minimal tensor substrate for the Lamina pipeline-parallelism core.
//!
//! Provides the `Tensor` type the pipeline exchanges between stages:
//! - Dtypes relevant to the inter-stage wire format (F32, I32, I64, Bool)
//! - A `requires_grad` flag used as the "has upstream gradient" signal
//! - A small reference op set so stages and tests can execute end to end
//!
//! This crate deliberately carries no autodiff graph and no optimized
//! kernels; both are external collaborators of the pipeline core.

pub mod dtype;
pub mod device;
pub mod shape;
pub mod storage;
pub mod tensor;
pub mod ops;
pub mod error;

pub use dtype::DType;
pub use device::Device;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;
pub use error::LaminaError;

pub type Result<T> = std::result::Result<T, LaminaError>;
