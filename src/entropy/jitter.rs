//! Scheduling and Timing Jitter.
//!
//! Two things live here:
//! - [`JitterPool`]: a bounded set of "spinner" threads, each bumping a byte
//!   counter and sleeping. The counters advance in competition with every other
//!   thread on the machine, so their combined value carries a little scheduling
//!   noise. The fast poll samples it before every output block.
//! - [`JitterRng`]: a custom entropy source harvesting CPU execution timing
//!   variance (cache misses, pipeline stalls, interrupts).
//!
//! # Design
//! - **Explicit Lifetime**: Spinners are owned by a `JitterPool` and joined on
//!   shutdown. The process-wide pool is created lazily or with [`init`] and torn
//!   down with [`shutdown`].
//! - **Injectable**: Consumers depend on [`JitterSource`], not on the pool.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{EntropyError, EntropySource};

/// Default number of spinner threads.
pub const JITTER_THREADS: usize = 8;

/// Sleep between counter increments.
const SPIN_INTERVAL: Duration = Duration::from_millis(100);

/// Anything that can hand out a jitter byte without blocking.
pub trait JitterSource: Send + Sync {
    /// Returns the current jitter sample.
    fn sample(&self) -> u8;
}

/// Pool of spinner threads.
pub struct JitterPool {
    counters: Arc<[AtomicU8]>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JitterPool {
    /// Starts `count` spinner threads.
    ///
    /// A spinner that the OS refuses to spawn is dropped; its counter stays at 0.
    pub fn start(count: usize) -> Self {
        let counters: Arc<[AtomicU8]> = (0..count).map(|_| AtomicU8::new(0)).collect();
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(count);

        for i in 0..count {
            let counters = Arc::clone(&counters);
            let stop = Arc::clone(&stop);
            let spawned = thread::Builder::new()
                .name(format!("csprng-jitter-{}", i))
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        counters[i].fetch_add(1, Ordering::Relaxed);
                        thread::park_timeout(SPIN_INTERVAL);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => log::warn!("Jitter spinner {} failed to start: {}", i, e),
            }
        }

        log::debug!("Jitter pool started with {} spinners", workers.len());
        Self {
            counters,
            stop,
            workers: Mutex::new(workers),
        }
    }

    /// Number of running spinners.
    pub fn spinners(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stops and joins every spinner. Sampling keeps working afterwards and
    /// returns the frozen counters.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl JitterSource for JitterPool {
    fn sample(&self) -> u8 {
        self.counters
            .iter()
            .fold(0u8, |acc, c| acc ^ c.load(Ordering::Relaxed))
    }
}

impl Drop for JitterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static GLOBAL: Mutex<Option<Arc<JitterPool>>> = Mutex::new(None);

/// Starts the process-wide jitter pool with `count` spinners.
///
/// Does nothing if it is already running.
pub fn init(count: usize) -> Arc<JitterPool> {
    let mut global = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(global.get_or_insert_with(|| Arc::new(JitterPool::start(count))))
}

/// Returns the process-wide jitter pool, starting it with
/// [`JITTER_THREADS`] spinners on first use.
pub fn global() -> Arc<JitterPool> {
    init(JITTER_THREADS)
}

/// Stops the process-wide jitter pool. Generators that already hold it keep
/// sampling frozen counters; the next [`global`] call starts a new pool.
pub fn shutdown() {
    let pool = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(pool) = pool {
        pool.shutdown();
    }
}

/// CPU timing jitter entropy source.
pub struct JitterRng {
    batch: usize,
    quality: f64,
}

impl JitterRng {
    /// Bytes produced per batch by default.
    pub const DEFAULT_BATCH: usize = 32;

    /// Creates a source producing `DEFAULT_BATCH` bytes credited at `quality`.
    pub fn new(quality: f64) -> Self {
        Self {
            batch: Self::DEFAULT_BATCH,
            quality,
        }
    }

    /// Performs a tiny amount of CPU-intensive work to induce jitter.
    #[inline(always)]
    fn jitter_loop() {
        let mut x = 0u64;
        for i in 0..10 {
            x = x.wrapping_add(i);
            core::hint::black_box(x);
        }
    }

    fn delta(origin: Instant) -> u64 {
        let start = origin.elapsed().as_nanos() as u64;
        Self::jitter_loop();
        let end = origin.elapsed().as_nanos() as u64;
        end.wrapping_sub(start)
    }
}

impl Default for JitterRng {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl EntropySource for JitterRng {
    fn name(&self) -> &str {
        "CpuJitter"
    }

    fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError> {
        let origin = Instant::now();

        // A clock that never moves has nothing to offer.
        if (0..16).all(|_| Self::delta(origin) == 0) {
            return Err(EntropyError::NotSupported);
        }

        let mut out = vec![0u8; self.batch];
        for byte in out.iter_mut() {
            let mut acc = 0u8;
            // 8 samples folded to parity per bit.
            for _ in 0..8 {
                let mut folded = 0u64;
                for _ in 0..8 {
                    folded ^= Self::delta(origin);
                }
                acc = (acc << 1) | (folded.count_ones() % 2) as u8;
            }
            *byte = acc;
        }
        Ok(out)
    }

    fn quality(&self) -> f64 {
        self.quality
    }
}
