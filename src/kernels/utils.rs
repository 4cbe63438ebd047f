/// Rounds `size` up to a multiple of `n`, which must be a power of two.
pub fn align_size(size: usize, n: usize) -> usize {
    (size + n - 1) & !(n - 1)
}

/// Effective footprint of a dilated kernel.
pub fn kernel_extent(kernel: usize, dilation: usize) -> usize {
    dilation * (kernel - 1) + 1
}

/// Output extent of a transposed convolution before any border is cut.
/// `input` must be at least 1.
pub fn deconv_output_size(input: usize, kernel: usize, stride: usize, dilation: usize) -> usize {
    (input - 1) * stride + kernel_extent(kernel, dilation)
}

/// Source coordinate feeding output `o` through flipped kernel tap `k`, if any.
///
/// The tap contributes only when `o + k*dilation - (extent-1)` lands exactly on
/// a stride multiple and the quotient is inside `[0, input)`.
#[inline(always)]
pub fn deconv_source_index(
    o: usize,
    k: usize,
    dilation: usize,
    extent: usize,
    stride: usize,
    input: usize,
) -> Option<usize> {
    let s = (o + k * dilation) as isize - (extent - 1) as isize;
    if s < 0 || s % stride as isize != 0 {
        return None;
    }
    let s = s as usize / stride;
    (s < input).then_some(s)
}
