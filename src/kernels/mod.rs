pub mod activations;
pub mod deconv2d;
pub mod deconv_kxk;
pub mod deconv_packed;
pub mod math;
pub mod packing;
pub mod padding;
pub mod parallel;
pub mod utils;
pub use activations::Activation;
pub use deconv2d::deconv2d;
pub use deconv_packed::deconv_packed;
pub use packing::{pack_weights, unpack_weights, PackedWeights, WeightLayout};
pub use padding::copy_cut_border;
