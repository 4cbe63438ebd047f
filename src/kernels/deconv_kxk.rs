//! Specialized scalar-layout deconvolution for square 3x3 / 4x4 kernels with
//! stride 1 or 2 and no dilation.
//!
//! These scatter each input sample over its output footprint using the
//! unflipped weights. The activation is not fused here.

use super::math::{load4, store4};
use super::parallel::for_each_channel;
use crate::layer::DeconvParams;
use crate::tensor::Blob;
use wide::f32x4;

pub type DeconvFn = fn(&Blob, &mut Blob, &[f32], Option<&[f32]>, usize);

/// `[kernel_size - 3][stride - 1]`
const DECONV_TABLE: [[DeconvFn; 2]; 2] = [
    [deconv_kxk::<3, 1>, deconv_kxk::<3, 2>],
    [deconv_kxk::<4, 1>, deconv_kxk::<4, 2>],
];

/// Specialized kernel for `params`, or `None` when only the generic path
/// applies.
pub fn select(params: &DeconvParams) -> Option<DeconvFn> {
    if params.kernel_w != params.kernel_h || params.stride_w != params.stride_h {
        return None;
    }
    let (kernel, stride) = (params.kernel_w, params.stride_w);
    if !(3..=4).contains(&kernel)
        || !(1..=2).contains(&stride)
        || params.dilation_w != 1
        || params.dilation_h != 1
    {
        return None;
    }
    Some(DECONV_TABLE[kernel - 3][stride - 1])
}

/// `dst += src * k`
#[inline(always)]
fn axpy(dst: &mut [f32], src: &[f32], k: f32) {
    let kv = f32x4::splat(k);
    let mut d = dst.chunks_exact_mut(4);
    let mut s = src.chunks_exact(4);
    for (d4, s4) in (&mut d).zip(&mut s) {
        store4(d4, load4(s4).mul_add(kv, load4(d4)));
    }
    for (d1, s1) in d.into_remainder().iter_mut().zip(s.remainder()) {
        *d1 += s1 * k;
    }
}

fn deconv_kxk<const K: usize, const S: usize>(
    input: &Blob,
    out: &mut Blob,
    weight: &[f32],
    bias: Option<&[f32]>,
    num_threads: usize,
) {
    debug_assert_eq!(input.elempack, 1);
    let (w, h, inch) = (input.w, input.h, input.c);
    let outw = out.w;
    let plane = out.w * out.h;
    let maxk = K * K;
    let channel_len = out.channel_len();

    for_each_channel(out.data_mut(), channel_len, num_threads, |p, outptr| {
        outptr[..plane].fill(bias.map_or(0.0, |b| b[p]));
        for q in 0..inch {
            let img = input.channel(q);
            let kernel = &weight[(p * inch + q) * maxk..(p * inch + q + 1) * maxk];
            for i in 0..h {
                let src = img.row(i);
                for ky in 0..K {
                    let r = i * S + ky;
                    let orow = &mut outptr[r * outw..(r + 1) * outw];
                    for kx in 0..K {
                        let kv = kernel[ky * K + kx];
                        if S == 1 {
                            axpy(&mut orow[kx..kx + w], src, kv);
                        } else {
                            for (j, &v) in src.iter().enumerate() {
                                orow[j * S + kx] += v * kv;
                            }
                        }
                    }
                }
            }
        }
    });
}
