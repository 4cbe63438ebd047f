use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};

/// Workspace arena that recycles released blob storage.
///
/// A cached buffer is handed out again when the requested length lies within
/// `[capacity * 3/4, capacity]`, so a steady stream of same-sized forward calls
/// stops hitting the system allocator after the first one.
#[derive(Debug, Default)]
pub struct PoolAllocator {
    free: Mutex<Vec<Vec<f32>>>,
}

impl PoolAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take(&self, len: usize) -> Option<Vec<f32>> {
        let mut free = self.free.lock().ok()?;
        let idx = free
            .iter()
            .position(|b| b.capacity() >= len && len * 4 >= b.capacity() * 3)?;
        Some(free.swap_remove(idx))
    }

    pub(crate) fn give_back(&self, buf: Vec<f32>) {
        if buf.capacity() == 0 {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }

    /// Number of released buffers waiting for reuse.
    pub fn cached_buffers(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Drops every cached buffer.
    pub fn clear(&self) {
        if let Ok(mut free) = self.free.lock() {
            free.clear();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum Allocator {
    #[default]
    Heap,
    Pool(Arc<PoolAllocator>),
}

impl Allocator {
    pub fn pool() -> Self {
        Allocator::Pool(Arc::new(PoolAllocator::new()))
    }

    /// Zero-filled buffer of `len` floats.
    pub(crate) fn alloc_zeroed(&self, len: usize) -> Result<Vec<f32>> {
        if let Allocator::Pool(pool) = self {
            if let Some(mut buf) = pool.take(len) {
                buf.clear();
                buf.resize(len, 0.0);
                return Ok(buf);
            }
        }
        let mut buf = try_with_capacity(len)?;
        buf.resize(len, 0.0);
        Ok(buf)
    }

    pub(crate) fn pool_handle(&self) -> Option<Arc<PoolAllocator>> {
        match self {
            Allocator::Heap => None,
            Allocator::Pool(pool) => Some(pool.clone()),
        }
    }
}

/// Empty vector with room for exactly `len` elements, or `Error::Allocation`.
pub(crate) fn try_with_capacity<T>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::Allocation {
        bytes: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    Ok(buf)
}

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Upper bound on workers used for the output-channel loop.
    pub num_threads: usize,
    /// Use the 4-lane packed kernels. When off, the scalar-layout kernels run.
    pub use_packing_layout: bool,
    /// Allocator for blobs handed back to the caller.
    pub blob_allocator: Allocator,
    /// Allocator for intermediates such as the bordered output.
    pub workspace_allocator: Allocator,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            use_packing_layout: true,
            blob_allocator: Allocator::Heap,
            workspace_allocator: Allocator::Heap,
        }
    }
}

impl Options {
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn with_packing(mut self, use_packing_layout: bool) -> Self {
        self.use_packing_layout = use_packing_layout;
        self
    }
}
