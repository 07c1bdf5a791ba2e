//! Data model for additive-quantized linear layers: typed tensors, code
//! reinterpretation, shape checks and the dense reference path.

pub mod codes;
pub mod dequant;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod simd;
pub mod synth;
pub mod tensor;

pub use dtype::DType;
pub use error::{AqlmError, ErrorKind, Result};
pub use layout::{QuantShape, ScaleLayout};
pub use tensor::{Element, Storage, StorageElement, Tensor};
