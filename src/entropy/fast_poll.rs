//! Fast Poll.
//!
//! Cheap, always-available entropy stirred into the pool before every output
//! block: the jitter counters, the clock, free memory, the calling thread, a
//! stack address and, every [`BACKTRACE_INTERVAL`] stirs, a resolved call
//! stack. It maintains unpredictability between slow polls but never credits
//! quality.

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use super::jitter::{self, JitterSource};
use crate::pool::EntropyPool;

/// Stirs between two symbolized call stack snapshots.
pub const BACKTRACE_INTERVAL: u64 = 64;

/// Inline entropy stirring. Must not block and must not fail.
pub trait FastPoll: Send {
    /// Stirs ambient state into `pool` without touching its quality.
    fn stir(&mut self, pool: &mut EntropyPool);
}

/// Fast poll over the real process and machine state.
pub struct SystemFastPoll {
    jitter: Arc<dyn JitterSource>,
    stirs: u64,
}

impl SystemFastPoll {
    /// Uses the process-wide jitter pool.
    pub fn new() -> Self {
        Self::with_jitter(jitter::global())
    }

    /// Uses the given jitter source.
    pub fn with_jitter(jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter, stirs: 0 }
    }

    /// Symbolized call stack on the first stir and every
    /// [`BACKTRACE_INTERVAL`] stirs after it.
    fn call_stack(&mut self) -> Option<String> {
        let due = self.stirs % BACKTRACE_INTERVAL == 0;
        self.stirs = self.stirs.wrapping_add(1);
        due.then(|| Backtrace::force_capture().to_string())
    }
}

impl Default for SystemFastPoll {
    fn default() -> Self {
        Self::new()
    }
}

impl FastPoll for SystemFastPoll {
    fn stir(&mut self, pool: &mut EntropyPool) {
        pool.add_byte(self.jitter.sample());

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        pool.add_byte(now as u8);

        pool.add_byte(available_memory() as u8);

        let current = thread::current();
        if let Some(name) = current.name() {
            pool.absorb(name.as_bytes());
        }
        pool.absorb(format!("{:?}", current.id()).as_bytes());

        let marker = 0u8;
        let stack = std::ptr::addr_of!(marker) as usize;
        pool.absorb(&stack.to_le_bytes());

        if let Some(trace) = self.call_stack() {
            pool.absorb(trace.as_bytes());
        }
    }
}

/// Available memory in KiB, or 0 when the platform does not say.
#[cfg(target_os = "linux")]
fn available_memory() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn available_memory() -> u64 {
    0
}
