use super::math::{load4, sigmoid_ps, store4};
use crate::tensor::Blob;
use serde::{Deserialize, Serialize};
use wide::{f32x4, CmpLe};

/// Pointwise nonlinearity fused into a kernel's store.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activation {
    #[default]
    None,
    Relu,
    LeakyRelu { slope: f32 },
    Clip { min: f32, max: f32 },
    Sigmoid,
}

impl Activation {
    /// Builds an activation from the engine's numeric tag and parameters.
    /// Unknown tags map to `None`.
    pub fn from_tag(tag: i32, params: &[f32]) -> Self {
        let p = |i: usize| params.get(i).copied().unwrap_or(0.0);
        match tag {
            1 => Activation::Relu,
            2 => Activation::LeakyRelu { slope: p(0) },
            3 => Activation::Clip { min: p(0), max: p(1) },
            4 => Activation::Sigmoid,
            _ => Activation::None,
        }
    }

    pub fn tag(&self) -> i32 {
        match self {
            Activation::None => 0,
            Activation::Relu => 1,
            Activation::LeakyRelu { .. } => 2,
            Activation::Clip { .. } => 3,
            Activation::Sigmoid => 4,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Activation::None)
    }

    #[inline(always)]
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu { slope } => {
                if x > 0.0 {
                    x
                } else {
                    x * slope
                }
            }
            Activation::Clip { min, max } => x.max(min).min(max),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// Lane-wise version of [`Activation::apply`]. Sigmoid goes through the
    /// polynomial exp, so it agrees with the scalar form only to ~1e-6.
    #[inline(always)]
    pub fn apply_x4(&self, x: f32x4) -> f32x4 {
        match *self {
            Activation::None => x,
            Activation::Relu => x.max(f32x4::splat(0.0)),
            Activation::LeakyRelu { slope } => {
                let le = x.cmp_le(f32x4::splat(0.0));
                le.blend(x * f32x4::splat(slope), x)
            }
            Activation::Clip { min, max } => x.max(f32x4::splat(min)).min(f32x4::splat(max)),
            Activation::Sigmoid => sigmoid_ps(x),
        }
    }

    pub fn apply_slice(&self, data: &mut [f32]) {
        if self.is_none() {
            return;
        }
        let mut chunks = data.chunks_exact_mut(4);
        for c in &mut chunks {
            let v = self.apply_x4(load4(c));
            store4(c, v);
        }
        for x in chunks.into_remainder() {
            *x = self.apply(*x);
        }
    }

    /// In-place pass over a blob, used when the kernel itself does not fuse.
    pub fn forward_inplace(&self, blob: &mut Blob) {
        if self.is_none() || blob.is_empty() {
            return;
        }
        let plane = blob.w * blob.h * blob.elempack;
        let len = blob.channel_len();
        for ch in blob.data_mut().chunks_mut(len) {
            self.apply_slice(&mut ch[..plane]);
        }
    }
}
