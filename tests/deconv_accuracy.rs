// Deconvolution accuracy tests - every execution path against a direct scatter reference
use approx::assert_abs_diff_eq;
use packnn::{Activation, Allocator, Blob, DeconvParams, Deconvolution, Options};
use std::sync::Arc;

fn assert_close(a: &[f32], b: &[f32], tol: f32, name: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", name);
    let max_diff = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs() / y.abs().max(1.0))
        .fold(0.0f32, f32::max);

    if max_diff > tol {
        println!("Got:      {:?}", &a[..5.min(a.len())]);
        println!("Expected: {:?}", &b[..5.min(b.len())]);
        panic!("{} failed accuracy check: max diff = {:.6e} (tol = {:.6e})", name, max_diff, tol);
    }
}

fn seq(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7919 + seed * 104_729) % 1000) as f32 / 500.0 - 1.0)
        .collect()
}

/// Direct scatter: every input sample adds `value * weight` over its footprint.
fn reference_deconv(
    input: &[f32],
    w: usize,
    h: usize,
    inch: usize,
    weight: &[f32],
    bias: Option<&[f32]>,
    p: &DeconvParams,
) -> (Vec<f32>, usize, usize) {
    let (outw, outh) = p.bordered_shape(w, h);
    let maxk = p.maxk();
    let mut out = vec![0.0f32; p.num_output * outh * outw];
    for oc in 0..p.num_output {
        let b = bias.map_or(0.0, |b| b[oc]);
        out[oc * outh * outw..(oc + 1) * outh * outw].fill(b);
        for ic in 0..inch {
            let k = &weight[(oc * inch + ic) * maxk..(oc * inch + ic + 1) * maxk];
            for i in 0..h {
                for j in 0..w {
                    let v = input[(ic * h + i) * w + j];
                    for y in 0..p.kernel_h {
                        for x in 0..p.kernel_w {
                            let oy = i * p.stride_h + y * p.dilation_h;
                            let ox = j * p.stride_w + x * p.dilation_w;
                            out[(oc * outh + oy) * outw + ox] += v * k[y * p.kernel_w + x];
                        }
                    }
                }
            }
        }
    }
    let cw = outw - p.pad_left - p.pad_right;
    let ch = outh - p.pad_top - p.pad_bottom;
    let mut cropped = Vec::with_capacity(p.num_output * cw * ch);
    for oc in 0..p.num_output {
        for y in p.pad_top..p.pad_top + ch {
            let row = (oc * outh + y) * outw;
            cropped.extend_from_slice(&out[row + p.pad_left..row + p.pad_left + cw]);
        }
    }
    (cropped, cw, ch)
}

fn build(params: &DeconvParams, inch: usize, opt: &Options) -> (Deconvolution, Vec<f32>, Option<Vec<f32>>) {
    let weight = seq(params.maxk() * inch * params.num_output, 1);
    let bias = params.bias_term.then(|| seq(params.num_output, 2));
    let mut layer = Deconvolution::new(params.clone(), weight.clone(), bias.clone()).unwrap();
    layer.create_pipeline(opt).unwrap();
    (layer, weight, bias)
}

fn configs() -> Vec<(&'static str, DeconvParams)> {
    vec![
        ("k3s1", DeconvParams::new(0, 3, 1).with_bias(true)),
        ("k3s2", DeconvParams::new(0, 3, 2).with_bias(true)),
        ("k4s1", DeconvParams::new(0, 4, 1)),
        ("k4s2", DeconvParams::new(0, 4, 2).with_bias(true)),
        ("k3s2d2", DeconvParams::new(0, 3, 2).with_dilation(2, 2).with_bias(true)),
        ("k5s3", DeconvParams::new(0, 5, 3)),
        ("k2x3", {
            let mut p = DeconvParams::new(0, 2, 1).with_bias(true);
            p.kernel_h = 3;
            p.stride_w = 2;
            p.dilation_h = 2;
            p
        }),
        ("k4s2pad", DeconvParams::new(0, 4, 2).with_pad(1, 1, 1, 1).with_bias(true)),
        ("k3s1pad_asym", DeconvParams::new(0, 3, 1).with_pad(0, 2, 1, 0)),
    ]
}

fn check_all_paths(inch: usize, outch: usize) {
    let (w, h) = (5, 4);
    let input_data = seq(inch * w * h, 3);
    for (name, mut params) in configs() {
        params.num_output = outch;
        for packing in [true, false] {
            for threads in [1, 3] {
                let opt = Options::default().with_packing(packing).with_threads(threads);
                let (layer, weight, bias) = build(&params, inch, &opt);
                let (expected, ew, eh) =
                    reference_deconv(&input_data, w, h, inch, &weight, bias.as_deref(), &params);

                let input = Blob::from_planar(&input_data, w, h, inch, &Allocator::Heap).unwrap();
                let out = layer.forward(&input, &opt).unwrap();
                assert_eq!((out.w, out.h), (ew, eh), "{name}: shape");
                assert_eq!(out.logical_channels(), outch, "{name}: channels");
                let label = format!("{name} in={inch} out={outch} packing={packing} threads={threads}");
                assert_close(&out.to_planar(), &expected, 1e-4, &label);

                if inch % 4 == 0 {
                    let input4 = input.convert_packing(4, &Allocator::Heap).unwrap();
                    let out4 = layer.forward(&input4, &opt).unwrap();
                    assert_close(&out4.to_planar(), &expected, 1e-4, &format!("{label} pack4 input"));
                }
            }
        }
    }
}

#[test]
fn test_pack4_cell_matches_reference() {
    check_all_paths(8, 8);
}

#[test]
fn test_pack1to4_cell_matches_reference() {
    check_all_paths(3, 4);
}

#[test]
fn test_pack4to1_cell_matches_reference() {
    check_all_paths(4, 6);
}

#[test]
fn test_pack1_cell_matches_reference() {
    check_all_paths(3, 2);
}

#[test]
fn test_output_size_law() {
    let opt = Options::default().with_threads(1);
    for kernel in 1..=5 {
        for stride in 1..=3 {
            for dilation in 1..=3 {
                let params = DeconvParams::new(4, kernel, stride)
                    .with_dilation(dilation, dilation)
                    .with_pad(1, 0, 0, 1);
                let (layer, _, _) = build(&params, 4, &opt);
                let input = Blob::new(3, 2, 1, 4, &Allocator::Heap).unwrap();
                let out = layer.forward(&input, &opt).unwrap();
                let extent = dilation * (kernel - 1) + 1;
                assert_eq!(out.w, (3 - 1) * stride + extent - 1);
                assert_eq!(out.h, (2 - 1) * stride + extent - 1);
            }
        }
    }
}

/// Input 4x4 of ones, weights of ones, bias -10, ReLU.
/// Output pixel (i, j) sums `inch * rows(i) * cols(j)` taps.
fn ones_scenario(kernel: usize, stride: usize, pad: usize, counts: &[usize], packing: bool) {
    let inch = 4;
    let params = DeconvParams::new(4, kernel, stride)
        .with_pad(0, pad, 0, pad)
        .with_bias(true)
        .with_activation(Activation::Relu);
    let weight = vec![1.0; params.maxk() * inch * 4];
    let mut layer = Deconvolution::new(params, weight, Some(vec![-10.0; 4])).unwrap();
    let opt = Options::default().with_packing(packing);
    layer.create_pipeline(&opt).unwrap();

    let input = Blob::from_planar(&[1.0; 4 * 4 * 4], 4, 4, 4, &Allocator::Heap)
        .unwrap()
        .convert_packing(4, &Allocator::Heap)
        .unwrap();
    let out = layer.forward(&input, &opt).unwrap();
    let n = counts.len() - pad;
    assert_eq!((out.w, out.h), (n, n));
    assert_eq!(out.elempack, if packing { 4 } else { 1 });

    let planar = out.to_planar();
    for c in 0..4 {
        for i in 0..n {
            for j in 0..n {
                let expected = (-10.0 + (inch * counts[i] * counts[j]) as f32).max(0.0);
                assert_abs_diff_eq!(planar[(c * n + i) * n + j], expected, epsilon = 1e-5);
            }
        }
    }
}

#[test]
fn test_hand_computed_k3s1_relu() {
    let counts = [1, 2, 3, 3, 2, 1];
    ones_scenario(3, 1, 0, &counts, true);
    ones_scenario(3, 1, 0, &counts, false);
}

#[test]
fn test_hand_computed_k4s2_relu() {
    let counts = [1, 1, 2, 2, 2, 2, 2, 2, 1, 1];
    ones_scenario(4, 2, 0, &counts, true);
    ones_scenario(4, 2, 0, &counts, false);
    // cutting one trailing row and column gives 9x9
    ones_scenario(4, 2, 1, &counts, true);
}

#[test]
fn test_fused_activation_matches_separate_pass() {
    let acts = [
        Activation::Relu,
        Activation::LeakyRelu { slope: 0.1 },
        Activation::Clip { min: -0.5, max: 0.75 },
        Activation::Sigmoid,
    ];
    for (inch, outch) in [(8, 8), (3, 4), (4, 6), (3, 2)] {
        for packing in [true, false] {
            let opt = Options::default().with_packing(packing);
            let input_data = seq(inch * 6 * 5, 5);
            let input = Blob::from_planar(&input_data, 6, 5, inch, &Allocator::Heap).unwrap();

            let plain = DeconvParams::new(outch, 3, 2).with_bias(true);
            let (layer, _, _) = build(&plain, inch, &opt);
            let unfused = layer.forward(&input, &opt).unwrap().to_planar();

            for act in acts {
                let (layer, _, _) = build(&plain.clone().with_activation(act), inch, &opt);
                let fused = layer.forward(&input, &opt).unwrap().to_planar();
                let expected: Vec<f32> = unfused.iter().map(|&x| act.apply(x)).collect();
                // sigmoid goes through the polynomial exp on 4-lane paths
                assert_close(&fused, &expected, 1e-5, &format!("{act:?} packing={packing}"));
            }
        }
    }
}

#[test]
fn test_concurrent_forward_matches_sequential() {
    let opt = Options::default().with_threads(2);
    let params = DeconvParams::new(8, 4, 2)
        .with_bias(true)
        .with_pad(1, 1, 1, 1)
        .with_activation(Activation::Sigmoid);
    let (layer, _, _) = build(&params, 8, &opt);
    let layer = Arc::new(layer);

    let inputs: Vec<Blob> = (0..6)
        .map(|s| Blob::from_planar(&seq(8 * 7 * 7, s), 7, 7, 8, &Allocator::Heap).unwrap())
        .collect();
    let sequential: Vec<Vec<f32>> = inputs
        .iter()
        .map(|b| layer.forward(b, &opt).unwrap().to_planar())
        .collect();

    let concurrent: Vec<Vec<f32>> = std::thread::scope(|s| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|b| {
                let layer = layer.clone();
                let opt = opt.clone();
                s.spawn(move || layer.forward(b, &opt).unwrap().to_planar())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(sequential, concurrent);
}

#[test]
fn test_pool_allocators_reuse_buffers() {
    let pool = Allocator::pool();
    let opt = Options {
        blob_allocator: pool.clone(),
        workspace_allocator: pool.clone(),
        ..Options::default()
    };
    let params = DeconvParams::new(4, 3, 2).with_pad(1, 1, 1, 1);
    let (layer, _, _) = build(&params, 4, &opt);
    let input = Blob::from_planar(&seq(4 * 16, 9), 4, 4, 4, &Allocator::Heap).unwrap();

    let first = layer.forward(&input, &opt).unwrap().to_planar();
    let second = layer.forward(&input, &opt).unwrap().to_planar();
    assert_eq!(first, second);
    if let Allocator::Pool(p) = &pool {
        assert!(p.cached_buffers() > 0);
    }
}
