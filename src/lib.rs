//! Packed-layout transposed convolution for a lightweight inference runtime.
//!
//! A [`Deconvolution`] layer repacks its weights once in
//! [`Deconvolution::create_pipeline`] and then runs [`Deconvolution::forward`]
//! over [`Blob`] feature maps stored either one lane per element (pack1) or
//! four channels per element (pack4).
pub mod error;
pub mod kernels;
pub mod layer;
pub mod option;
pub mod tensor;

pub use error::{Error, Result};
pub use kernels::Activation;
pub use layer::{DeconvParams, Deconvolution};
pub use option::{Allocator, Options, PoolAllocator};
pub use tensor::{Blob, ChannelView};
