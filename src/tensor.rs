use crate::error::{Error, Result};
use crate::kernels::utils::align_size;
use crate::option::{try_with_capacity, Allocator, PoolAllocator};
use std::sync::Arc;

#[derive(Debug)]
struct Storage {
    data: Vec<f32>,
    pool: Option<Arc<PoolAllocator>>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            pool: None,
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.data));
        }
    }
}

/// Three-dimensional feature map `[c, h, w]` with `elempack` lanes interleaved
/// per stored element.
///
/// A pack4 blob with `c = 2` holds 8 logical channels; element `(q, y, x)`
/// stores logical channels `q*4 .. q*4+4` contiguously. Channels start every
/// `cstep` elements, where `cstep` rounds `w * h` up to a 16-byte boundary.
///
/// Storage is reference counted: clones and reshapes share it, and writes
/// through [`Blob::data_mut`] copy first when the storage is shared.
#[derive(Debug, Clone, Default)]
pub struct Blob {
    storage: Option<Arc<Storage>>,
    pub w: usize,
    pub h: usize,
    pub c: usize,
    /// Bytes per stored element, `4 * elempack` for f32.
    pub elemsize: usize,
    pub elempack: usize,
    /// Elements between the starts of consecutive channels.
    pub cstep: usize,
}

impl Blob {
    /// Zero-filled blob. Fails with [`Error::Allocation`] when the buffer
    /// cannot be reserved or its size does not fit in `usize`.
    pub fn new(w: usize, h: usize, c: usize, elempack: usize, allocator: &Allocator) -> Result<Self> {
        debug_assert!(matches!(elempack, 1 | 4 | 16), "unsupported elempack {elempack}");
        let elemsize = std::mem::size_of::<f32>() * elempack;
        let overflow = || Error::Allocation { bytes: usize::MAX };
        let cstep = w
            .checked_mul(h)
            .and_then(|n| n.checked_mul(elemsize))
            .and_then(|n| n.checked_next_multiple_of(16))
            .ok_or_else(overflow)?
            / elemsize;
        let len = cstep
            .checked_mul(c)
            .and_then(|n| n.checked_mul(elempack))
            .ok_or_else(overflow)?;
        let data = allocator.alloc_zeroed(len)?;
        Ok(Self {
            storage: Some(Arc::new(Storage {
                data,
                pool: allocator.pool_handle(),
            })),
            w,
            h,
            c,
            elemsize,
            elempack,
            cstep,
        })
    }

    /// Builds a pack1 blob from planar `[c, h, w]` data.
    pub fn from_planar(data: &[f32], w: usize, h: usize, c: usize, allocator: &Allocator) -> Result<Self> {
        let expected = w.saturating_mul(h).saturating_mul(c);
        if data.len() != expected {
            return Err(Error::DataSize {
                expected,
                actual: data.len(),
            });
        }
        let mut blob = Self::new(w, h, c, 1, allocator)?;
        let plane = w * h;
        let cstep = blob.cstep;
        let dst = blob.data_mut();
        for (q, src) in data.chunks_exact(plane.max(1)).enumerate().take(c) {
            dst[q * cstep..q * cstep + plane].copy_from_slice(src);
        }
        Ok(blob)
    }

    /// Planar `[logical channels, h, w]` copy with lanes unpacked.
    pub fn to_planar(&self) -> Vec<f32> {
        let plane = self.w * self.h;
        let mut out = vec![0.0; plane * self.c * self.elempack];
        for q in 0..self.c {
            let src = self.channel(q);
            for i in 0..plane {
                for lane in 0..self.elempack {
                    out[(q * self.elempack + lane) * plane + i] = src.data[i * self.elempack + lane];
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_none() || self.total() == 0
    }

    /// Stored elements including channel alignment gaps.
    pub fn total(&self) -> usize {
        self.cstep * self.c
    }

    pub fn logical_channels(&self) -> usize {
        self.c * self.elempack
    }

    /// Floats per channel, alignment gap included.
    pub fn channel_len(&self) -> usize {
        self.cstep * self.elempack
    }

    pub fn data(&self) -> &[f32] {
        match &self.storage {
            Some(s) => &s.data[..self.total() * self.elempack],
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        let len = self.total() * self.elempack;
        match &mut self.storage {
            Some(s) => &mut Arc::make_mut(s).data[..len],
            None => &mut [],
        }
    }

    /// True when another blob shares this blob's storage.
    pub fn is_shared(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| Arc::strong_count(s) > 1)
    }

    pub fn channel(&self, q: usize) -> ChannelView<'_> {
        let len = self.channel_len();
        ChannelView {
            data: &self.data()[q * len..(q + 1) * len],
            w: self.w,
            h: self.h,
            elempack: self.elempack,
        }
    }

    pub fn channel_mut(&mut self, q: usize) -> &mut [f32] {
        let len = self.channel_len();
        &mut self.data_mut()[q * len..(q + 1) * len]
    }

    pub fn fill(&mut self, v: f32) {
        self.data_mut().fill(v);
    }

    /// Reinterprets the blob as `[c, h, w]`. Shares storage when both layouts
    /// are gap-free, otherwise copies.
    pub fn reshape(&self, w: usize, h: usize, c: usize, allocator: &Allocator) -> Result<Blob> {
        debug_assert_eq!(w * h * c, self.w * self.h * self.c, "reshape changes element count");
        let elemsize = self.elemsize;
        let cstep = align_size(w * h * elemsize, 16) / elemsize;
        let src_dense = self.c <= 1 || self.cstep == self.w * self.h;
        let dst_dense = c <= 1 || cstep == w * h;
        if src_dense && dst_dense {
            return Ok(Blob {
                storage: self.storage.clone(),
                w,
                h,
                c,
                elemsize,
                elempack: self.elempack,
                cstep: if c <= 1 { w * h } else { cstep },
            });
        }
        let dense = self.dense_data()?;
        let mut out = Blob::new(w, h, c, self.elempack, allocator)?;
        let plane = w * h * self.elempack;
        let out_len = out.channel_len();
        let dst = out.data_mut();
        for (q, src) in dense.chunks_exact(plane.max(1)).enumerate().take(c) {
            dst[q * out_len..q * out_len + plane].copy_from_slice(src);
        }
        Ok(out)
    }

    fn dense_data(&self) -> Result<Vec<f32>> {
        let plane = self.w * self.h * self.elempack;
        let mut out = try_with_capacity(plane * self.c)?;
        for q in 0..self.c {
            out.extend_from_slice(&self.channel(q).data[..plane]);
        }
        Ok(out)
    }

    /// Converts between pack1 and pack4. The logical channel count must be a
    /// multiple of the target pack factor.
    pub fn convert_packing(&self, elempack: usize, allocator: &Allocator) -> Result<Blob> {
        if elempack == self.elempack {
            return Ok(self.clone());
        }
        let channels = self.logical_channels();
        debug_assert_eq!(channels % elempack, 0, "cannot pack {channels} channels by {elempack}");
        let mut out = Blob::new(self.w, self.h, channels / elempack, elempack, allocator)?;
        let plane = self.w * self.h;
        let (src_pack, out_len) = (self.elempack, out.channel_len());
        let src_len = self.channel_len();
        let src = self.data();
        let dst = out.data_mut();
        for ch in 0..channels {
            let (sq, sl) = (ch / src_pack, ch % src_pack);
            let (dq, dl) = (ch / elempack, ch % elempack);
            for i in 0..plane {
                dst[dq * out_len + i * elempack + dl] = src[sq * src_len + i * src_pack + sl];
            }
        }
        Ok(out)
    }
}

/// Read-only view of one channel: `h` rows of `w * elempack` floats.
#[derive(Debug, Clone, Copy)]
pub struct ChannelView<'a> {
    pub data: &'a [f32],
    pub w: usize,
    pub h: usize,
    pub elempack: usize,
}

impl<'a> ChannelView<'a> {
    pub fn row(&self, y: usize) -> &'a [f32] {
        let stride = self.w * self.elempack;
        &self.data[y * stride..(y + 1) * stride]
    }

    /// # Safety
    /// `y` must be less than `self.h`.
    #[inline(always)]
    pub(crate) unsafe fn row_unchecked(&self, y: usize) -> &'a [f32] {
        debug_assert!(y < self.h, "row {y} out of {}", self.h);
        let stride = self.w * self.elempack;
        unsafe { self.data.get_unchecked(y * stride..(y + 1) * stride) }
    }
}
