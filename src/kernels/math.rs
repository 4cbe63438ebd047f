use wide::{f32x4, CmpGt};

#[inline(always)]
pub(crate) fn load4(s: &[f32]) -> f32x4 {
    f32x4::new([s[0], s[1], s[2], s[3]])
}

#[inline(always)]
pub(crate) fn store4(d: &mut [f32], v: f32x4) {
    d[..4].copy_from_slice(&v.to_array());
}

/// Pairwise horizontal sum: `(a0 + a1) + (a2 + a3)`.
#[inline(always)]
pub(crate) fn hsum4(v: f32x4) -> f32 {
    let a = v.to_array();
    (a[0] + a[1]) + (a[2] + a[3])
}

/// Fast vectorized exp approximation.
/// Cephes approach: exp(x) = 2^n * exp(r) with r in [-ln2/2, ln2/2] and a
/// degree-5 polynomial for exp(r).
/// Accuracy: max relative error ~1e-6 over [-88, 88]; inputs outside are clamped.
#[inline(always)]
pub fn exp_ps(x: f32x4) -> f32x4 {
    let c_exp_hi = f32x4::splat(88.376_26);
    let c_exp_lo = f32x4::splat(-88.376_26);
    let c_log2ef = f32x4::splat(std::f32::consts::LOG2_E);
    let c_ln2_hi = f32x4::splat(0.693_359_375);
    let c_ln2_lo = f32x4::splat(-2.121_944_4e-4);

    let c_p0 = f32x4::splat(1.987_569_1e-4);
    let c_p1 = f32x4::splat(1.398_199_9e-3);
    let c_p2 = f32x4::splat(8.333_452e-3);
    let c_p3 = f32x4::splat(4.166_579_6e-2);
    let c_p4 = f32x4::splat(1.666_666_5e-1);
    let c_p5 = f32x4::splat(5.000_000_1e-1);
    let one = f32x4::splat(1.0);
    let half = f32x4::splat(0.5);
    // 1.5 * 2^23: adding and subtracting rounds to the nearest integer
    let magic = f32x4::splat(12_582_912.0);

    let x = x.max(c_exp_lo).min(c_exp_hi);

    let fx = x.mul_add(c_log2ef, half);
    let rounded = (fx + magic) - magic;
    let fx = rounded.cmp_gt(fx).blend(rounded - one, rounded);

    let x = x - fx * c_ln2_hi;
    let x = x - fx * c_ln2_lo;

    let mut y = c_p0.mul_add(x, c_p1);
    y = y.mul_add(x, c_p2);
    y = y.mul_add(x, c_p3);
    y = y.mul_add(x, c_p4);
    y = y.mul_add(x, c_p5);
    let xx = x * x;
    y = y.mul_add(xx, x) + one;

    let pow2n = f32x4::new(
        fx.to_array()
            .map(|n| f32::from_bits(((n as i32 + 127) as u32) << 23)),
    );
    y * pow2n
}

#[inline(always)]
pub fn sigmoid_ps(x: f32x4) -> f32x4 {
    let one = f32x4::splat(1.0);
    one / (one + exp_ps(f32x4::splat(0.0) - x))
}
