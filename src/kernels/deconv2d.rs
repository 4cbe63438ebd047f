use super::parallel::for_each_channel;
use crate::error::{Error, Result};
use crate::layer::DeconvParams;
use crate::tensor::Blob;
use faer::linalg::matmul::matmul as faer_matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use std::sync::atomic::{AtomicBool, Ordering};

/// Generic 2D deconvolution (transposed convolution) using GEMM + col2im.
/// Any kernel size, stride and dilation; pack1 input and output.
///
/// Per output channel `p`:
/// `cols[maxk, h*w] = W_p[maxk, inch] x X[inch, h*w]`, then every tap row of
/// `cols` is scattered into the output at `(i*stride + y*dilation, ...)`.
/// Weights are the unflipped `kw-kh-inch-outch` data. The activation is not
/// fused here.
pub fn deconv2d(
    input: &Blob,
    weight: &[f32],
    bias: Option<&[f32]>,
    params: &DeconvParams,
    out: &mut Blob,
    num_threads: usize,
) -> Result<()> {
    debug_assert_eq!(input.elempack, 1);
    let (w, h, inch) = (input.w, input.h, input.c);
    let spatial = w * h;
    let maxk = params.maxk();
    let (kernel_w, kernel_h) = (params.kernel_w, params.kernel_h);
    let (stride_w, stride_h) = (params.stride_w, params.stride_h);
    let (dilation_w, dilation_h) = (params.dilation_w, params.dilation_h);
    let outw = out.w;
    let plane = out.w * out.h;
    let in_cstep = input.cstep;
    let input_data = input.data();
    let channel_len = out.channel_len();
    let oom = AtomicBool::new(false);

    // Reuse thread-local col buffer to avoid repeated allocation
    thread_local! {
        static COL_BUF: std::cell::RefCell<Vec<f32>> = std::cell::RefCell::new(Vec::new());
    }

    for_each_channel(out.data_mut(), channel_len, num_threads, |p, outptr| {
        outptr[..plane].fill(bias.map_or(0.0, |b| b[p]));
        if spatial == 0 || inch == 0 {
            return;
        }
        COL_BUF.with(|buf_cell| {
            let mut col_buf_ref = buf_cell.borrow_mut();
            let needed = maxk * spatial;
            if col_buf_ref.len() < needed {
                let extra = needed - col_buf_ref.len();
                if col_buf_ref.try_reserve_exact(extra).is_err() {
                    oom.store(true, Ordering::Relaxed);
                    return;
                }
                col_buf_ref.resize(needed, 0.0);
            }
            let cols = &mut col_buf_ref[..needed];

            unsafe {
                let w_ptr = weight.as_ptr().add(p * inch * maxk);
                // W_p: rows are taps (stride 1), columns are input channels (stride maxk)
                let w_mat = MatRef::<f32>::from_raw_parts(w_ptr, maxk, inch, 1, maxk as isize);
                let in_mat = MatRef::<f32>::from_raw_parts(
                    input_data.as_ptr(), inch, spatial, in_cstep as isize, 1,
                );
                let col_mat = MatMut::<f32>::from_raw_parts_mut(
                    cols.as_mut_ptr(), maxk, spatial, spatial as isize, 1,
                );
                faer_matmul(col_mat, Accum::Replace, w_mat, in_mat, 1.0, Par::Seq);
            }

            // col2im
            for y in 0..kernel_h {
                for x in 0..kernel_w {
                    let col_row = &cols[(y * kernel_w + x) * spatial..(y * kernel_w + x + 1) * spatial];
                    for i in 0..h {
                        let orow = (i * stride_h + y * dilation_h) * outw + x * dilation_w;
                        let src = &col_row[i * w..(i + 1) * w];
                        for (j, &v) in src.iter().enumerate() {
                            outptr[orow + j * stride_w] += v;
                        }
                    }
                }
            }
        });
    });

    if oom.load(Ordering::Relaxed) {
        return Err(Error::Allocation {
            bytes: maxk * spatial * std::mem::size_of::<f32>(),
        });
    }
    Ok(())
}
