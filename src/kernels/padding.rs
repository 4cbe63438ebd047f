use crate::error::{Error, Result};
use crate::option::Allocator;
use crate::tensor::Blob;

/// Copies the interior of `src`, dropping `top`/`bottom` rows and
/// `left`/`right` columns from every channel. Pack factor is preserved.
///
/// Fails with [`Error::BorderTooLarge`] when the margins cover the whole
/// width or height.
pub fn copy_cut_border(
    src: &Blob,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
    allocator: &Allocator,
) -> Result<Blob> {
    let (horizontal, vertical) = (left.saturating_add(right), top.saturating_add(bottom));
    if horizontal >= src.w || vertical >= src.h {
        return Err(Error::BorderTooLarge {
            w: src.w,
            h: src.h,
            horizontal,
            vertical,
        });
    }
    let w = src.w - horizontal;
    let h = src.h - vertical;
    let mut dst = Blob::new(w, h, src.c, src.elempack, allocator)?;
    let ep = src.elempack;
    for q in 0..src.c {
        let s = src.channel(q);
        let d = dst.channel_mut(q);
        for y in 0..h {
            let row = s.row(y + top);
            d[y * w * ep..(y + 1) * w * ep].copy_from_slice(&row[left * ep..(left + w) * ep]);
        }
    }
    Ok(dst)
}
