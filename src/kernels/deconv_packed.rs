//! Packed-layout deconvolution.
//!
//! One accumulation loop per (input pack, output pack) cell. Every cell walks
//! the flipped kernel over each output pixel and gathers the input samples
//! that land on a stride multiple, so no output element is written twice and
//! the activation can be applied right before the store.

use super::activations::Activation;
use super::math::{hsum4, load4, store4};
use super::packing::{PackedWeights, WeightLayout};
use super::parallel::for_each_channel;
use super::utils::{deconv_source_index, kernel_extent};
use crate::error::Result;
use crate::layer::DeconvParams;
use crate::option::try_with_capacity;
use crate::tensor::Blob;
use wide::f32x4;

/// Valid `(tap, source)` pairs for every output coordinate along one axis.
#[derive(Debug)]
pub(crate) struct TapTable {
    starts: Vec<usize>,
    taps: Vec<(usize, usize)>,
}

impl TapTable {
    pub(crate) fn new(out_len: usize, kernel: usize, dilation: usize, stride: usize, input: usize) -> Result<Self> {
        let extent = kernel_extent(kernel, dilation);
        let mut starts = try_with_capacity(out_len + 1)?;
        let mut taps = try_with_capacity(out_len.saturating_mul(kernel))?;
        for o in 0..out_len {
            starts.push(taps.len());
            for k in 0..kernel {
                if let Some(s) = deconv_source_index(o, k, dilation, extent, stride, input) {
                    taps.push((k, s));
                }
            }
        }
        starts.push(taps.len());
        Ok(Self { starts, taps })
    }

    #[inline(always)]
    pub(crate) fn get(&self, o: usize) -> &[(usize, usize)] {
        &self.taps[self.starts[o]..self.starts[o + 1]]
    }
}

struct Cell<'a> {
    input: &'a Blob,
    weights: &'a PackedWeights,
    bias: Option<&'a [f32]>,
    activation: Activation,
    kernel_w: usize,
    maxk: usize,
    outw: usize,
    outh: usize,
    rows: TapTable,
    cols: TapTable,
}

/// Computes `out` (already sized to the bordered output) from `input`.
///
/// `input.elempack` must equal `weights.layout.in_pack()` and `out.elempack`
/// must equal `weights.layout.out_pack()`.
pub fn deconv_packed(
    input: &Blob,
    weights: &PackedWeights,
    bias: Option<&[f32]>,
    params: &DeconvParams,
    out: &mut Blob,
    num_threads: usize,
) -> Result<()> {
    let layout = weights.layout;
    debug_assert_eq!(input.elempack, layout.in_pack());
    debug_assert_eq!(out.elempack, layout.out_pack());
    debug_assert_eq!(input.logical_channels(), weights.num_input);

    let cell = Cell {
        input,
        weights,
        bias,
        activation: params.activation,
        kernel_w: params.kernel_w,
        maxk: params.maxk(),
        outw: out.w,
        outh: out.h,
        rows: TapTable::new(out.h, params.kernel_h, params.dilation_h, params.stride_h, input.h)?,
        cols: TapTable::new(out.w, params.kernel_w, params.dilation_w, params.stride_w, input.w)?,
    };

    let channel_len = out.channel_len();
    let body: fn(&Cell, usize, &mut [f32]) = match layout {
        WeightLayout::Pack4 => pack4,
        WeightLayout::Pack1To4 => pack1to4,
        WeightLayout::Pack4To1 => pack4to1,
        WeightLayout::Pack1 => pack1,
    };
    for_each_channel(out.data_mut(), channel_len, num_threads, |p, outptr| {
        body(&cell, p, outptr)
    });
    Ok(())
}

fn pack4(cell: &Cell, p: usize, outptr: &mut [f32]) {
    let channels = cell.input.c;
    let kgroup = cell.weights.group(p);
    let bias = cell.bias.map_or(f32x4::splat(0.0), |b| load4(&b[p * 4..]));
    for i in 0..cell.outh {
        let rows = cell.rows.get(i);
        for j in 0..cell.outw {
            let cols = cell.cols.get(j);
            let mut sum = bias;
            for q in 0..channels {
                let m = cell.input.channel(q);
                let kptr = &kgroup[cell.maxk * q * 16..cell.maxk * (q + 1) * 16];
                for &(y, sy) in rows {
                    // SAFETY: the tap table only yields sy < input.h
                    let row = unsafe { m.row_unchecked(sy) };
                    for &(x, sx) in cols {
                        let val = &row[sx * 4..sx * 4 + 4];
                        let k = y * cell.kernel_w + x;
                        let w = &kptr[k * 16..k * 16 + 16];
                        sum = load4(&w[0..]).mul_add(f32x4::splat(val[0]), sum);
                        sum = load4(&w[4..]).mul_add(f32x4::splat(val[1]), sum);
                        sum = load4(&w[8..]).mul_add(f32x4::splat(val[2]), sum);
                        sum = load4(&w[12..]).mul_add(f32x4::splat(val[3]), sum);
                    }
                }
            }
            let off = (i * cell.outw + j) * 4;
            store4(&mut outptr[off..], cell.activation.apply_x4(sum));
        }
    }
}

fn pack1to4(cell: &Cell, p: usize, outptr: &mut [f32]) {
    let channels = cell.input.c;
    let kgroup = cell.weights.group(p);
    let bias = cell.bias.map_or(f32x4::splat(0.0), |b| load4(&b[p * 4..]));
    for i in 0..cell.outh {
        let rows = cell.rows.get(i);
        for j in 0..cell.outw {
            let cols = cell.cols.get(j);
            let mut sum = bias;
            for q in 0..channels {
                let m = cell.input.channel(q);
                let kptr = &kgroup[cell.maxk * q * 4..cell.maxk * (q + 1) * 4];
                for &(y, sy) in rows {
                    // SAFETY: the tap table only yields sy < input.h
                    let row = unsafe { m.row_unchecked(sy) };
                    for &(x, sx) in cols {
                        let k = y * cell.kernel_w + x;
                        sum = load4(&kptr[k * 4..]).mul_add(f32x4::splat(row[sx]), sum);
                    }
                }
            }
            let off = (i * cell.outw + j) * 4;
            store4(&mut outptr[off..], cell.activation.apply_x4(sum));
        }
    }
}

fn pack4to1(cell: &Cell, p: usize, outptr: &mut [f32]) {
    let channels = cell.input.c;
    let kgroup = cell.weights.group(p);
    let bias = cell.bias.map_or(0.0, |b| b[p]);
    for i in 0..cell.outh {
        let rows = cell.rows.get(i);
        for j in 0..cell.outw {
            let cols = cell.cols.get(j);
            let mut sum = bias;
            for q in 0..channels {
                let m = cell.input.channel(q);
                let kptr = &kgroup[cell.maxk * q * 4..cell.maxk * (q + 1) * 4];
                for &(y, sy) in rows {
                    // SAFETY: the tap table only yields sy < input.h
                    let row = unsafe { m.row_unchecked(sy) };
                    for &(x, sx) in cols {
                        let k = y * cell.kernel_w + x;
                        // dot of 4 input lanes with 4 weight lanes
                        sum += hsum4(load4(&row[sx * 4..]) * load4(&kptr[k * 4..]));
                    }
                }
            }
            outptr[i * cell.outw + j] = cell.activation.apply(sum);
        }
    }
}

fn pack1(cell: &Cell, p: usize, outptr: &mut [f32]) {
    let channels = cell.input.c;
    let kgroup = cell.weights.group(p);
    let bias = cell.bias.map_or(0.0, |b| b[p]);
    for i in 0..cell.outh {
        let rows = cell.rows.get(i);
        for j in 0..cell.outw {
            let cols = cell.cols.get(j);
            let mut sum = bias;
            for q in 0..channels {
                let m = cell.input.channel(q);
                let kptr = &kgroup[cell.maxk * q..cell.maxk * (q + 1)];
                for &(y, sy) in rows {
                    // SAFETY: the tap table only yields sy < input.h
                    let row = unsafe { m.row_unchecked(sy) };
                    for &(x, sx) in cols {
                        sum += row[sx] * kptr[y * cell.kernel_w + x];
                    }
                }
            }
            outptr[i * cell.outw + j] = cell.activation.apply(sum);
        }
    }
}
