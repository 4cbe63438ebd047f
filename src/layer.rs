use crate::error::{Error, Result};
use crate::kernels::activations::Activation;
use crate::kernels::deconv2d::deconv2d;
use crate::kernels::deconv_kxk;
use crate::kernels::deconv_packed::deconv_packed;
use crate::kernels::packing::{pack_weights, PackedWeights};
use crate::kernels::padding::copy_cut_border;
use crate::kernels::utils::{deconv_output_size, kernel_extent};
use crate::option::{Allocator, Options};
use crate::tensor::Blob;
use serde::{Deserialize, Serialize};

/// Deconvolution layer configuration. Immutable once the layer is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvParams {
    pub num_output: usize,
    pub kernel_w: usize,
    pub kernel_h: usize,
    pub dilation_w: usize,
    pub dilation_h: usize,
    pub stride_w: usize,
    pub stride_h: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub bias_term: bool,
    pub activation: Activation,
}

impl Default for DeconvParams {
    fn default() -> Self {
        Self {
            num_output: 0,
            kernel_w: 1,
            kernel_h: 1,
            dilation_w: 1,
            dilation_h: 1,
            stride_w: 1,
            stride_h: 1,
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            bias_term: false,
            activation: Activation::None,
        }
    }
}

impl DeconvParams {
    /// Square kernel and stride, no padding, no dilation.
    pub fn new(num_output: usize, kernel: usize, stride: usize) -> Self {
        Self {
            num_output,
            kernel_w: kernel,
            kernel_h: kernel,
            stride_w: stride,
            stride_h: stride,
            ..Self::default()
        }
    }

    pub fn with_dilation(mut self, dilation_w: usize, dilation_h: usize) -> Self {
        self.dilation_w = dilation_w;
        self.dilation_h = dilation_h;
        self
    }

    pub fn with_pad(mut self, left: usize, right: usize, top: usize, bottom: usize) -> Self {
        self.pad_left = left;
        self.pad_right = right;
        self.pad_top = top;
        self.pad_bottom = bottom;
        self
    }

    pub fn with_bias(mut self, bias_term: bool) -> Self {
        self.bias_term = bias_term;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn maxk(&self) -> usize {
        self.kernel_w * self.kernel_h
    }

    pub fn has_padding(&self) -> bool {
        self.pad_left > 0 || self.pad_right > 0 || self.pad_top > 0 || self.pad_bottom > 0
    }

    /// Output size before the border is cut.
    pub fn bordered_shape(&self, w: usize, h: usize) -> (usize, usize) {
        (
            deconv_output_size(w, self.kernel_w, self.stride_w, self.dilation_w),
            deconv_output_size(h, self.kernel_h, self.stride_h, self.dilation_h),
        )
    }

    /// Final output size for a `w x h` input.
    pub fn output_shape(&self, w: usize, h: usize) -> (usize, usize) {
        let (outw, outh) = self.bordered_shape(w, h);
        (
            outw.saturating_sub(self.pad_left + self.pad_right),
            outh.saturating_sub(self.pad_top + self.pad_bottom),
        )
    }
}

/// State built by [`Deconvolution::create_pipeline`].
#[derive(Debug)]
struct Pipeline {
    activation: Activation,
    packed: Option<PackedWeights>,
}

/// Transposed 2D convolution over `[c, h, w]` blobs.
///
/// Lifecycle: [`new`](Self::new), then [`create_pipeline`](Self::create_pipeline)
/// once, then any number of [`forward`](Self::forward) calls, which may run
/// concurrently from several threads. [`destroy_pipeline`](Self::destroy_pipeline)
/// releases the pipeline state.
#[derive(Debug)]
pub struct Deconvolution {
    params: DeconvParams,
    num_input: usize,
    weight_data: Vec<f32>,
    bias_data: Option<Vec<f32>>,
    pipeline: Option<Pipeline>,
}

impl Deconvolution {
    /// `weight_data` is ordered `kw-kh-inch-outch`; the input channel count is
    /// derived from its length.
    pub fn new(params: DeconvParams, weight_data: Vec<f32>, bias_data: Option<Vec<f32>>) -> Result<Self> {
        let per_input = params.maxk() * params.num_output;
        let num_input = if per_input == 0 { 0 } else { weight_data.len() / per_input };
        if num_input == 0 || weight_data.len() != per_input * num_input {
            return Err(Error::WeightSize {
                expected: per_input * num_input.max(1),
                actual: weight_data.len(),
            });
        }
        let bias_data = if params.bias_term {
            let actual = bias_data.as_ref().map_or(0, |b| b.len());
            if actual != params.num_output {
                return Err(Error::BiasSize {
                    expected: params.num_output,
                    actual,
                });
            }
            bias_data
        } else {
            None
        };
        Ok(Self {
            params,
            num_input,
            weight_data,
            bias_data,
            pipeline: None,
        })
    }

    pub fn params(&self) -> &DeconvParams {
        &self.params
    }

    pub fn num_input(&self) -> usize {
        self.num_input
    }

    /// Repacked weights, present after `create_pipeline` with packing enabled.
    pub fn packed_weights(&self) -> Option<&PackedWeights> {
        self.pipeline.as_ref().and_then(|p| p.packed.as_ref())
    }

    /// One-time setup: builds the activation and, when packing is enabled,
    /// the repacked weights. Must finish before any `forward`.
    pub fn create_pipeline(&mut self, opt: &Options) -> Result<()> {
        let packed = if opt.use_packing_layout {
            let packed = pack_weights(
                &self.weight_data,
                self.params.maxk(),
                self.num_input,
                self.params.num_output,
                &Allocator::Heap,
            )?;
            tracing::debug!(
                layout = ?packed.layout,
                num_input = self.num_input,
                num_output = self.params.num_output,
                maxk = self.params.maxk(),
                "repacked deconvolution weights"
            );
            Some(packed)
        } else {
            None
        };
        self.pipeline = Some(Pipeline {
            activation: self.params.activation,
            packed,
        });
        Ok(())
    }

    pub fn destroy_pipeline(&mut self, _opt: &Options) -> Result<()> {
        self.pipeline = None;
        Ok(())
    }

    /// Runs the layer on `input`. An input with no rows or columns yields an
    /// empty blob.
    pub fn forward(&self, input: &Blob, opt: &Options) -> Result<Blob> {
        let pipeline = self.pipeline.as_ref().ok_or(Error::PipelineNotCreated)?;
        if input.w == 0 || input.h == 0 {
            tracing::trace!(w = input.w, h = input.h, "deconvolution on empty input");
            return Ok(Blob::default());
        }
        let params = &self.params;
        let bias = self.bias_data.as_deref();
        let num_threads = opt.num_threads.max(1);
        let (outw, outh) = params.bordered_shape(input.w, input.h);
        let bordered_allocator = if params.has_padding() {
            &opt.workspace_allocator
        } else {
            &opt.blob_allocator
        };

        let mut bordered = match pipeline.packed.as_ref().filter(|_| opt.use_packing_layout) {
            Some(packed) => {
                let input = input.convert_packing(packed.layout.in_pack(), &opt.workspace_allocator)?;
                let out_pack = packed.layout.out_pack();
                let mut out = Blob::new(outw, outh, params.num_output / out_pack, out_pack, bordered_allocator)?;
                tracing::trace!(layout = ?packed.layout, outw, outh, "deconvolution packed path");
                deconv_packed(&input, packed, bias, params, &mut out, num_threads)?;
                out
            }
            None => {
                let input = input.convert_packing(1, &opt.workspace_allocator)?;
                let mut out = Blob::new(outw, outh, params.num_output, 1, bordered_allocator)?;
                match deconv_kxk::select(params) {
                    Some(deconv) => {
                        tracing::trace!(kernel = params.kernel_w, stride = params.stride_w, "deconvolution kxk path");
                        deconv(&input, &mut out, &self.weight_data, bias, num_threads);
                    }
                    None => {
                        tracing::trace!(
                            kernel_w = params.kernel_w,
                            kernel_h = params.kernel_h,
                            extent_w = kernel_extent(params.kernel_w, params.dilation_w),
                            "deconvolution generic path"
                        );
                        deconv2d(&input, &self.weight_data, bias, params, &mut out, num_threads)?;
                    }
                }
                pipeline.activation.forward_inplace(&mut out);
                out
            }
        };

        if params.has_padding() {
            bordered = copy_cut_border(
                &bordered,
                params.pad_top,
                params.pad_bottom,
                params.pad_left,
                params.pad_right,
                &opt.blob_allocator,
            )?;
        }
        Ok(bordered)
    }
}
