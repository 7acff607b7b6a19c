//! Continuously-Seeded Pseudo-Random Generator.
//!
//! An entropy-pool generator after Peter Gutmann's cryptlib PRNG:
//! 1. The internal state cannot be determined from knowledge of the input.
//! 2. It resists bias introduced by specific inputs.
//! 3. The output does not reveal the state of the generator.
//!
//! # Design
//! - **Pool**: 260 bytes, SHA-1 mixed, fed by slow polls and a fast poll.
//! - **Output Stage**: AES-256 in an X9.17-like construction, keyed from the pool
//!   and rekeyed every [`X917_LIFETIME`] cipher blocks.
//! - **Masking**: Each output block is the two halves of a complemented,
//!   mixed and whitened copy of the pool folded together. The live pool never
//!   leaves the generator.
//! - **Locking**: All state sits behind one mutex; the slow-poll worker only
//!   talks to it through a channel.

mod x917;

pub use x917::{KEY_SIZE, X917_LIFETIME, X917_POOL_SIZE};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, Zeroizing};

use crate::config::{EnvProperties, GeneratorConfig, SourceRegistry};
use crate::entropy::collector::{Collector, Harvest, PollHandle, PollState, Wait};
use crate::entropy::fast_poll::{FastPoll, SystemFastPoll};
use crate::error::CsprngError;
use crate::pool::{EntropyPool, POOL_SIZE};
use x917::X917State;

/// Bytes produced per output block.
pub const OUTPUT_SIZE: usize = POOL_SIZE / 2;

/// Mix passes applied to the live pool per output block.
pub const MIX_COUNT: usize = 10;

/// The generator. Cheap to share behind an `Arc`; every call except
/// [`Csprng::cancel_poll`] takes the instance lock.
pub struct Csprng {
    inner: Mutex<GeneratorState>,
    cancel: Arc<AtomicBool>,
}

struct GeneratorState {
    pool: EntropyPool,
    x917: X917State,
    buffer: Zeroizing<[u8; OUTPUT_SIZE]>,
    ndx: usize,
    collector: Collector,
    poll: Option<PollHandle>,
    blocking: bool,
    poll_timeout: Option<Duration>,
    fast_poll: Box<dyn FastPoll>,
}

impl Csprng {
    /// Creates a generator and produces its first block, which runs the
    /// initial slow poll.
    ///
    /// # Errors
    /// * `CsprngError::InsufficientEntropy` if the configuration is blocking and
    ///   its sources cannot bring the pool to full quality.
    pub fn new(config: GeneratorConfig) -> Result<Self, CsprngError> {
        Self::with_fast_poll(config, Box::new(SystemFastPoll::new()))
    }

    /// Like [`Csprng::new`], with a caller-supplied fast poll.
    pub fn with_fast_poll(
        config: GeneratorConfig,
        fast_poll: Box<dyn FastPoll>,
    ) -> Result<Self, CsprngError> {
        let GeneratorConfig {
            file_sources,
            url_sources,
            program_sources,
            other_sources,
            blocking,
            poll_timeout,
        } = config;

        let collector = Collector::new(file_sources, url_sources, program_sources, other_sources);
        let cancel = collector.cancel_flag();
        log::debug!(
            "Bootstrapping generator with {} sources (blocking: {})",
            collector.source_count(),
            blocking
        );

        let mut state = GeneratorState {
            pool: EntropyPool::new(),
            x917: X917State::new(),
            buffer: Zeroizing::new([0u8; OUTPUT_SIZE]),
            ndx: OUTPUT_SIZE,
            collector,
            poll: None,
            blocking,
            poll_timeout,
            fast_poll,
        };
        state.refill()?;

        Ok(Self {
            inner: Mutex::new(state),
            cancel,
        })
    }

    /// Generator configured from `CSPRNG_*` environment variables with the
    /// default source registry.
    pub fn system_instance() -> Result<Self, CsprngError> {
        let config = GeneratorConfig::from_properties(&EnvProperties, &SourceRegistry::with_defaults())?;
        Self::new(config)
    }

    fn state(&self) -> MutexGuard<'_, GeneratorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Produces one fresh output block, independent of the buffered stream
    /// served by [`Csprng::next_bytes`].
    pub fn fill_block(&self) -> Result<[u8; OUTPUT_SIZE], CsprngError> {
        let mut block = [0u8; OUTPUT_SIZE];
        self.state().generate_block(&mut block)?;
        Ok(block)
    }

    /// Fills `out` from the buffered output stream.
    pub fn next_bytes(&self, out: &mut [u8]) -> Result<(), CsprngError> {
        self.state().next_bytes(out)
    }

    /// Next byte of the buffered output stream.
    pub fn next_byte(&self) -> Result<u8, CsprngError> {
        let mut b = [0u8; 1];
        self.next_bytes(&mut b)?;
        Ok(b[0])
    }

    /// Stirs one byte into the pool. Does not change quality.
    pub fn add_random_byte(&self, b: u8) {
        self.state().pool.add_byte(b);
    }

    /// Stirs `buf[offset..offset + length]` into the pool. Does not change quality.
    ///
    /// # Errors
    /// * `CsprngError::IndexOutOfRange` if the range does not fit `buf`.
    pub fn add_random_bytes(&self, buf: &[u8], offset: usize, length: usize) -> Result<(), CsprngError> {
        self.state().pool.add_bytes(buf, offset, length)
    }

    /// Pool quality after folding in any entropy a background poll delivered.
    pub fn quality(&self) -> f64 {
        let mut state = self.state();
        state.absorb_pending();
        state.pool.quality()
    }

    /// Runs a slow poll now, honouring the blocking setting.
    ///
    /// Does nothing while a previous poll is still running.
    pub fn slow_poll(&self) -> Result<(), CsprngError> {
        self.state().slow_poll()
    }

    /// State of the most recent slow poll.
    pub fn poll_state(&self) -> PollState {
        let mut state = self.state();
        state.absorb_pending();
        state.poll.as_mut().map_or(PollState::Idle, PollHandle::state)
    }

    /// Asks a running slow poll to stop. Entropy it already delivered is kept.
    ///
    /// Does not take the instance lock, so it also stops a poll another thread
    /// is blocked on; that call then fails with `InsufficientEntropy` unless the
    /// pool already reached full quality.
    pub fn cancel_poll(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl GeneratorState {
    fn absorb(&mut self, harvest: Harvest) {
        self.pool.absorb(&harvest.bytes);
        self.pool.add_quality(harvest.quality);
    }

    fn absorb_pending(&mut self) {
        while let Some(harvest) = self.poll.as_ref().and_then(PollHandle::try_next) {
            self.absorb(harvest);
        }
    }

    fn slow_poll(&mut self) -> Result<(), CsprngError> {
        self.absorb_pending();

        if let Some(poll) = self.poll.as_mut() {
            if !poll.is_finished() {
                return Ok(());
            }
            poll.state();
        }
        // A finished worker has sent everything it is going to.
        self.absorb_pending();
        self.poll = None;

        if self.pool.is_seeded() {
            return Ok(());
        }

        self.poll = self.collector.start(self.pool.quality());
        if self.poll.is_none() {
            return if self.blocking {
                Err(CsprngError::InsufficientEntropy)
            } else {
                Ok(())
            };
        }
        if !self.blocking {
            return Ok(());
        }

        let deadline = self.poll_timeout.map(|t| Instant::now() + t);
        loop {
            let next = match self.poll.as_ref() {
                Some(poll) => poll.wait(deadline),
                None => Wait::Finished,
            };
            match next {
                Wait::Harvest(harvest) => self.absorb(harvest),
                Wait::Finished => break,
                Wait::TimedOut => {
                    log::warn!(
                        "Slow poll interrupted after {:?} at quality {:.1}",
                        self.poll_timeout.unwrap_or_default(),
                        self.pool.quality()
                    );
                    return Ok(());
                }
            }
        }

        if let Some(poll) = self.poll.as_mut() {
            poll.state();
        }
        if !self.pool.is_seeded() {
            log::warn!("Slow poll exhausted its sources at quality {:.1}", self.pool.quality());
            return Err(CsprngError::InsufficientEntropy);
        }
        Ok(())
    }

    fn generate_block(&mut self, out: &mut [u8; OUTPUT_SIZE]) -> Result<(), CsprngError> {
        self.absorb_pending();
        if !self.pool.is_seeded() {
            self.slow_poll()?;
        }

        self.fast_poll.stir(&mut self.pool);
        for _ in 0..MIX_COUNT {
            self.pool.mix();
        }
        if self.x917.needs_rekey() {
            self.rekey();
        }

        let mut export = self.pool.complement();
        self.pool.mix();
        self.pool.mix_external(&mut export[..]);
        self.x917.generate(&mut export[..]);

        let (low, high) = export.split_at(OUTPUT_SIZE);
        for ((o, a), b) in out.iter_mut().zip(low.iter()).zip(high.iter()) {
            *o = a ^ b;
        }
        Ok(())
    }

    fn rekey(&mut self) {
        self.pool.mix();
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&self.pool.bytes()[..KEY_SIZE]);
        self.x917.rekey(&key);

        self.pool.mix();
        self.x917.generate(self.pool.bytes_mut());
        self.pool.mix();
        self.x917.generate(self.pool.bytes_mut());

        // The bootstrap key keeps the quality of the poll that seeded it.
        if self.x917.is_initialized() {
            self.pool.reset_quality();
            // A running worker counts credit from the old quality.
            if let Some(poll) = self.poll.as_ref() {
                poll.cancel();
            }
        }
        self.x917.mark_initialized();
        log::info!("Output cipher rekeyed");
    }

    fn refill(&mut self) -> Result<(), CsprngError> {
        let mut block = Zeroizing::new([0u8; OUTPUT_SIZE]);
        self.generate_block(&mut block)?;
        *self.buffer = *block;
        self.ndx = 0;
        Ok(())
    }

    fn next_bytes(&mut self, out: &mut [u8]) -> Result<(), CsprngError> {
        let mut filled = 0;
        while filled < out.len() {
            if self.ndx == OUTPUT_SIZE {
                self.refill()?;
            }
            let n = (OUTPUT_SIZE - self.ndx).min(out.len() - filled);
            let served = &mut self.buffer[self.ndx..self.ndx + n];
            out[filled..filled + n].copy_from_slice(served);
            served.zeroize();
            self.ndx += n;
            filled += n;
        }
        Ok(())
    }
}

impl Drop for GeneratorState {
    fn drop(&mut self) {
        if let Some(poll) = self.poll.as_ref() {
            poll.cancel();
        }
    }
}

impl RngCore for Csprng {
    fn next_u32(&mut self) -> u32 {
        rand_core::impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if let Err(e) = self.next_bytes(dest) {
            panic!("Error: {}", e);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.next_bytes(dest).map_err(rand_core::Error::from)
    }
}

impl CryptoRng for Csprng {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceDescriptor;
    use crate::entropy::custom::BufferedSource;
    use crate::entropy::{EntropyError, EntropySource};
    use std::io::Write;
    use std::thread;

    /// Stirs a constant so that runs are reproducible.
    struct FixedFastPoll(u8);

    impl FastPoll for FixedFastPoll {
        fn stir(&mut self, pool: &mut EntropyPool) {
            pool.add_byte(self.0);
        }
    }

    /// Returns the same bytes forever.
    struct RepeatingSource(Vec<u8>, f64);

    impl EntropySource for RepeatingSource {
        fn name(&self) -> &str {
            "repeating"
        }

        fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError> {
            Ok(self.0.clone())
        }

        fn quality(&self) -> f64 {
            self.1
        }
    }

    /// Sleeps for the given number of milliseconds per read.
    struct SlowSource(u64);

    impl EntropySource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError> {
            thread::sleep(Duration::from_millis(self.0));
            Ok(vec![1])
        }

        fn quality(&self) -> f64 {
            1.0
        }
    }

    fn seeded_config(seed: &[u8]) -> GeneratorConfig {
        let source = BufferedSource::new("seed", 100.0);
        source.add_bytes(seed);
        let mut config = GeneratorConfig::new();
        config.add_other(source);
        config
    }

    fn deterministic(seed: &[u8]) -> Csprng {
        Csprng::with_fast_poll(seeded_config(seed), Box::new(FixedFastPoll(0x42))).unwrap()
    }

    fn slow_config(count: usize) -> GeneratorConfig {
        let mut config = GeneratorConfig::new();
        for _ in 0..count {
            config.add_other(SlowSource(300));
        }
        config
    }

    /// Blocks each read until the test releases it.
    struct GatedSource(std::sync::mpsc::Receiver<()>);

    impl EntropySource for GatedSource {
        fn name(&self) -> &str {
            "gated"
        }

        fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError> {
            self.0.recv().map_err(|_| EntropyError::Exhausted)?;
            Ok(vec![0x33; 8])
        }

        fn quality(&self) -> f64 {
            50.0
        }
    }

    /// Generates blocks until the cipher lifetime runs out, then one more so
    /// the rekey drops quality to 0.
    fn run_past_rekey(csprng: &Csprng) {
        while csprng.state().x917.iterations() < X917_LIFETIME {
            csprng.fill_block().unwrap();
        }
        csprng.fill_block().unwrap();
    }

    fn wait_for_poll(csprng: &Csprng) -> PollState {
        let deadline = Instant::now() + Duration::from_secs(5);
        while csprng.poll_state() == PollState::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        csprng.poll_state()
    }

    #[test]
    fn test_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Csprng>();
    }

    #[test]
    fn test_zero_file_end_to_end() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 256]).unwrap();
        file.flush().unwrap();

        let mut config = GeneratorConfig::new();
        config.add_source(SourceDescriptor::file(100.0, 0, 256, file.path()).unwrap());
        let csprng = Csprng::new(config).unwrap();

        csprng.slow_poll().unwrap();
        assert_eq!(csprng.quality(), 100.0);

        let first = csprng.fill_block().unwrap();
        let second = csprng.fill_block().unwrap();
        assert_eq!(first.len(), OUTPUT_SIZE);
        assert_ne!(first, second);
    }

    #[test]
    fn test_blocking_fails_below_full_quality() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[3u8; 64]).unwrap();
        file.flush().unwrap();

        let mut config = GeneratorConfig::new();
        config.add_source(SourceDescriptor::file(40.0, 0, 64, file.path()).unwrap());
        let source = BufferedSource::new("events", 30.0);
        source.add_bytes(b"mouse moved");
        config.add_other(source);

        assert_eq!(
            Csprng::with_fast_poll(config, Box::new(FixedFastPoll(0))).err(),
            Some(CsprngError::InsufficientEntropy)
        );
    }

    #[test]
    fn test_blocking_without_sources_fails() {
        assert_eq!(
            Csprng::with_fast_poll(GeneratorConfig::new(), Box::new(FixedFastPoll(0))).err(),
            Some(CsprngError::InsufficientEntropy)
        );
    }

    #[test]
    fn test_non_blocking_returns_immediately() {
        let mut config = slow_config(50);
        config.set_blocking(false);

        let started = Instant::now();
        let csprng = Csprng::with_fast_poll(config, Box::new(FixedFastPoll(0))).unwrap();
        let block = csprng.fill_block().unwrap();

        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(block.len(), OUTPUT_SIZE);
        assert!(csprng.quality() < 100.0);
        assert_eq!(csprng.poll_state(), PollState::Running);
        csprng.cancel_poll();
    }

    #[test]
    fn test_blocking_timeout_counts_as_interruption() {
        let mut config = slow_config(50);
        config.poll_timeout = Some(Duration::from_millis(50));

        let started = Instant::now();
        let csprng = Csprng::with_fast_poll(config, Box::new(FixedFastPoll(0))).unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(csprng.quality() < 100.0);
    }

    #[test]
    fn test_background_poll_entropy_is_absorbed() {
        let mut config = seeded_config(&[0x11; 32]);
        config.set_blocking(false);
        let csprng = Csprng::with_fast_poll(config, Box::new(FixedFastPoll(0))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while csprng.poll_state() == PollState::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(csprng.quality(), 100.0);
        assert_eq!(csprng.poll_state(), PollState::Satisfied);
    }

    #[test]
    fn test_identical_seeds_give_identical_streams() {
        let a = deterministic(b"identical seed material");
        let b = deterministic(b"identical seed material");

        let mut out_a = [0u8; 1000];
        let mut out_b = [0u8; 1000];
        a.next_bytes(&mut out_a).unwrap();
        b.next_bytes(&mut out_b).unwrap();
        assert_eq!(out_a[..], out_b[..]);
    }

    #[test]
    fn test_different_seeds_give_different_streams() {
        let a = deterministic(b"seed one");
        let b = deterministic(b"seed two");

        assert_ne!(a.fill_block().unwrap(), b.fill_block().unwrap());
    }

    #[test]
    fn test_system_fast_poll_decorrelates_instances() {
        let a = Csprng::new(seeded_config(b"same seed")).unwrap();
        let b = Csprng::new(seeded_config(b"same seed")).unwrap();

        let mut out_a = [0u8; 8 * OUTPUT_SIZE];
        let mut out_b = [0u8; 8 * OUTPUT_SIZE];
        a.next_bytes(&mut out_a).unwrap();
        b.next_bytes(&mut out_b).unwrap();
        assert_ne!(out_a[..], out_b[..]);
    }

    #[test]
    fn test_consecutive_blocks_differ() {
        let csprng = deterministic(b"seed");
        let mut previous = csprng.fill_block().unwrap();
        for _ in 0..16 {
            let next = csprng.fill_block().unwrap();
            assert_ne!(previous, next);
            previous = next;
        }
    }

    #[test]
    fn test_buffered_stream_is_split_independent() {
        let a = deterministic(b"split");
        let b = deterministic(b"split");

        let mut whole = [0u8; 300];
        a.next_bytes(&mut whole).unwrap();

        let mut parts = [0u8; 300];
        b.next_bytes(&mut parts[..7]).unwrap();
        b.next_bytes(&mut parts[7..128]).unwrap();
        b.next_bytes(&mut parts[128..129]).unwrap();
        parts[129] = b.next_byte().unwrap();
        b.next_bytes(&mut parts[130..]).unwrap();

        assert_eq!(whole[..], parts[..]);
    }

    #[test]
    fn test_rekey_after_lifetime_resets_quality() {
        let mut config = GeneratorConfig::new();
        config.add_other(RepeatingSource(vec![0x5A; 64], 100.0));
        let csprng = Csprng::with_fast_poll(config, Box::new(FixedFastPoll(7))).unwrap();

        // The bootstrap key does not consume the bootstrap quality.
        assert_eq!(csprng.quality(), 100.0);

        while csprng.state().x917.iterations() < X917_LIFETIME {
            csprng.fill_block().unwrap();
            assert_eq!(csprng.quality(), 100.0);
        }

        csprng.fill_block().unwrap();
        assert_eq!(csprng.quality(), 0.0);
        assert!(csprng.state().x917.iterations() < X917_LIFETIME);

        // The next block polls again before producing output.
        csprng.fill_block().unwrap();
        assert_eq!(csprng.quality(), 100.0);
    }

    #[test]
    fn test_add_random_bytes_bounds() {
        let csprng = deterministic(b"bounds");
        let buf = [1u8; 16];
        assert_eq!(csprng.add_random_bytes(&buf, 10, 7), Err(CsprngError::IndexOutOfRange));
        assert!(csprng.add_random_bytes(&buf, 10, 6).is_ok());
        csprng.add_random_byte(0xEE);
    }

    #[test]
    fn test_injected_bytes_change_output_not_quality() {
        let a = deterministic(b"inject");
        let b = deterministic(b"inject");
        b.add_random_bytes(b"extra", 0, 5).unwrap();

        assert_eq!(a.quality(), b.quality());
        assert_ne!(a.fill_block().unwrap(), b.fill_block().unwrap());
    }

    #[test]
    fn test_rng_core() {
        let mut csprng = deterministic(b"rng core");
        let x = csprng.next_u64();
        let y = csprng.next_u64();
        assert_ne!(x, y);

        let mut buf = [0u8; 33];
        csprng.try_fill_bytes(&mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_cancel_interrupts_blocking_poll_on_other_thread() {
        let mut config = seeded_config(b"first poll only");
        for _ in 0..60 {
            config.add_other(SlowSource(50));
        }
        let csprng = Arc::new(Csprng::with_fast_poll(config, Box::new(FixedFastPoll(1))).unwrap());
        run_past_rekey(&csprng);
        assert_eq!(csprng.quality(), 0.0);

        let blocked = Arc::clone(&csprng);
        let worker = thread::spawn(move || {
            let started = Instant::now();
            let result = blocked.fill_block();
            (result.err(), started.elapsed())
        });

        thread::sleep(Duration::from_millis(100));
        let cancelled_at = Instant::now();
        csprng.cancel_poll();
        assert!(cancelled_at.elapsed() < Duration::from_millis(50));

        let (err, elapsed) = worker.join().unwrap();
        assert_eq!(err, Some(CsprngError::InsufficientEntropy));
        assert!(elapsed < Duration::from_secs(1), "blocked for {:?}", elapsed);
        assert_eq!(csprng.poll_state(), PollState::Stopped);
    }

    #[test]
    fn test_rekey_stops_background_poll() {
        let (release, gate) = std::sync::mpsc::channel();
        let mut config = seeded_config(b"background");
        config.add_other(GatedSource(gate));
        config.set_blocking(false);
        let csprng = Csprng::with_fast_poll(config, Box::new(FixedFastPoll(2))).unwrap();
        assert_eq!(wait_for_poll(&csprng), PollState::Satisfied);

        run_past_rekey(&csprng);
        assert_eq!(csprng.quality(), 0.0);

        // Starts a worker that parks on the gated source.
        csprng.fill_block().unwrap();
        assert_eq!(csprng.poll_state(), PollState::Running);

        run_past_rekey(&csprng);
        release.send(()).unwrap();
        assert_eq!(wait_for_poll(&csprng), PollState::Stopped);
    }
}
