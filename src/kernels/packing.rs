//! Weight repacking for the packed deconvolution kernels.
//!
//! Source weights are ordered `kw-kh-inch-outch`: `maxk` contiguous taps for
//! each (output, input) channel pair. Repacking first flips every tap block
//! (deconvolution gathers with the spatially reversed kernel), then
//! interleaves channels so one 4-lane load yields one lane group:
//!
//! | layout     | blob `[c, h, w]`             | elempack | element lanes       |
//! |------------|------------------------------|----------|---------------------|
//! | `Pack4`    | `[outch/4, inch/4, maxk]`    | 16       | 4 inputs x 4 outputs |
//! | `Pack1To4` | `[outch/4, inch, maxk]`      | 4        | 4 outputs           |
//! | `Pack4To1` | `[outch, inch/4, maxk]`      | 4        | 4 inputs            |
//! | `Pack1`    | `[outch, inch, maxk]`        | 1        | -                   |

use crate::error::Result;
use crate::option::{try_with_capacity, Allocator};
use crate::tensor::Blob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightLayout {
    Pack1,
    Pack1To4,
    Pack4To1,
    Pack4,
}

impl WeightLayout {
    /// Layout is a pure function of channel divisibility by the lane width.
    pub fn select(num_input: usize, num_output: usize) -> Self {
        match (num_input % 4 == 0, num_output % 4 == 0) {
            (true, true) => WeightLayout::Pack4,
            (false, true) => WeightLayout::Pack1To4,
            (true, false) => WeightLayout::Pack4To1,
            (false, false) => WeightLayout::Pack1,
        }
    }

    pub fn in_pack(&self) -> usize {
        match self {
            WeightLayout::Pack4 | WeightLayout::Pack4To1 => 4,
            WeightLayout::Pack1 | WeightLayout::Pack1To4 => 1,
        }
    }

    pub fn out_pack(&self) -> usize {
        match self {
            WeightLayout::Pack4 | WeightLayout::Pack1To4 => 4,
            WeightLayout::Pack1 | WeightLayout::Pack4To1 => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackedWeights {
    pub layout: WeightLayout,
    pub maxk: usize,
    pub num_input: usize,
    pub num_output: usize,
    pub data: Blob,
}

impl PackedWeights {
    /// Taps of output group `p`, all input groups back to back.
    #[inline]
    pub fn group(&self, p: usize) -> &[f32] {
        self.data.channel(p).data
    }
}

/// Reverses each `maxk` tap block.
pub fn flip_kernels(weight: &[f32], maxk: usize) -> Result<Vec<f32>> {
    let mut out = try_with_capacity(weight.len())?;
    for block in weight.chunks_exact(maxk) {
        out.extend(block.iter().rev());
    }
    Ok(out)
}

#[inline(always)]
fn packed_index(layout: WeightLayout, maxk: usize, p: usize, k: usize, q: usize, channel_len: usize) -> usize {
    let (ip, op) = (layout.in_pack(), layout.out_pack());
    let lanes = ip * op;
    let group = q / op;
    let row = p / ip;
    // input lane major, output lane minor
    let lane = (p % ip) * op + q % op;
    group * channel_len + (row * maxk + k) * lanes + lane
}

/// Flips and interleaves `weight` into the layout chosen for the channel
/// counts. The caller guarantees `weight.len() == maxk * num_input * num_output`.
pub fn pack_weights(
    weight: &[f32],
    maxk: usize,
    num_input: usize,
    num_output: usize,
    allocator: &Allocator,
) -> Result<PackedWeights> {
    debug_assert_eq!(weight.len(), maxk * num_input * num_output);
    let layout = WeightLayout::select(num_input, num_output);
    let (ip, op) = (layout.in_pack(), layout.out_pack());
    let flipped = flip_kernels(weight, maxk)?;

    let mut data = Blob::new(maxk, num_input / ip, num_output / op, ip * op, allocator)?;
    let channel_len = data.channel_len();
    let dst = data.data_mut();
    for q in 0..num_output {
        for p in 0..num_input {
            let src = &flipped[(q * num_input + p) * maxk..(q * num_input + p + 1) * maxk];
            for (k, &v) in src.iter().enumerate() {
                dst[packed_index(layout, maxk, p, k, q, channel_len)] = v;
            }
        }
    }

    Ok(PackedWeights {
        layout,
        maxk,
        num_input,
        num_output,
        data,
    })
}

/// Inverse of [`pack_weights`]: back to unflipped `kw-kh-inch-outch` order.
pub fn unpack_weights(packed: &PackedWeights) -> Vec<f32> {
    let PackedWeights {
        layout,
        maxk,
        num_input,
        num_output,
        ..
    } = *packed;
    let channel_len = packed.data.channel_len();
    let src = packed.data.data();
    let mut out = vec![0.0; maxk * num_input * num_output];
    for q in 0..num_output {
        for p in 0..num_input {
            let base = (q * num_input + p) * maxk;
            for k in 0..maxk {
                out[base + maxk - 1 - k] = src[packed_index(layout, maxk, p, k, q, channel_len)];
            }
        }
    }
    out
}
