//! Truncated path signatures on Candle: the signature transform of
//! piecewise-linear paths and its reverse-mode derivative.

pub mod layout;
pub mod signature;
pub mod tensor_algebra;

pub use layout::signature_channels;
pub use signature::{
    max_parallelism, set_max_parallelism, signature_backward, signature_checkargs,
    signature_combine_backward, signature_combine_forward, signature_forward,
};

// Re-export core Candle types for convenience in downstream crates and tests
pub use candle_core::{DType, Device, Tensor};

// Graded outer-product helpers are provided via the sig-augment sub-crate
// which wraps Candle ops.
pub use sig_augment::TensorAlgebraExt;
