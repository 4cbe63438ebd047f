use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Largest worker count a pool is built for. Requests above it share the
/// largest pool, so the cache holds at most this many pools.
const MAX_POOL_THREADS: usize = 64;

fn pool_size(num_threads: usize) -> usize {
    num_threads.clamp(1, MAX_POOL_THREADS)
}

fn pool(num_threads: usize) -> Option<Arc<ThreadPool>> {
    let num_threads = pool_size(num_threads);
    static POOLS: OnceLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = OnceLock::new();
    let mut pools = POOLS.get_or_init(Default::default).lock().ok()?;
    if let Some(p) = pools.get(&num_threads) {
        return Some(p.clone());
    }
    match ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("packnn-{i}"))
        .build()
    {
        Ok(p) => {
            let p = Arc::new(p);
            pools.insert(num_threads, p.clone());
            Some(p)
        }
        Err(e) => {
            tracing::warn!(error = %e, num_threads, "thread pool unavailable, running sequentially");
            None
        }
    }
}

/// Runs `f(p, channel)` for every `channel_len`-sized chunk of `out` on at
/// most `num_threads` workers and returns once all chunks are done.
///
/// Chunks are disjoint, so iterations share nothing mutable.
pub fn for_each_channel<F>(out: &mut [f32], channel_len: usize, num_threads: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if channel_len == 0 {
        return;
    }
    let channels = out.len().div_ceil(channel_len);
    let pool = if num_threads > 1 && channels > 1 {
        pool(num_threads)
    } else {
        None
    };
    match pool {
        Some(pool) => pool.install(|| {
            out.par_chunks_mut(channel_len)
                .enumerate()
                .for_each(|(p, ch)| f(p, ch))
        }),
        None => out
            .chunks_mut(channel_len)
            .enumerate()
            .for_each(|(p, ch)| f(p, ch)),
    }
}
