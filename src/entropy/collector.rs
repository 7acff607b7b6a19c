//! Slow-Poll Entropy Collector.
//!
//! Reads the configured sources on a dedicated worker thread and hands the
//! harvested bytes back over a channel.
//!
//! # States
//! - **Idle**: No worker has been started (or its result was collected).
//! - **Running**: The worker is polling sources.
//! - **Satisfied**: Credited quality reached 100.
//! - **Stopped**: Cancelled, or the generator stopped listening.
//! - **Exhausted**: Every source was visited once without reaching 100.
//!
//! # Design
//! - **Round-Robin**: One file, one URL, one program, one custom source per round.
//! - **Proportional Credit**: A descriptor source earns
//!   `quality * bytes_read / read_count`; a custom source earns its declared quality.
//! - **Failure Isolation**: A source that errors is logged and skipped.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use zeroize::Zeroizing;

use super::sources::read_source;
use super::EntropySource;
use crate::config::SourceDescriptor;
use crate::pool::MAX_QUALITY;

/// Lifecycle of a slow poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Running,
    Satisfied,
    Stopped,
    Exhausted,
}

/// Bytes read from one source and the quality they earn.
pub struct Harvest {
    pub bytes: Zeroizing<Vec<u8>>,
    pub quality: f64,
}

/// Result of waiting on a running poll.
pub enum Wait {
    /// The worker delivered a harvest.
    Harvest(Harvest),
    /// The worker finished and every harvest has been received.
    Finished,
    /// The deadline passed first.
    TimedOut,
}

type SharedSources = Arc<Mutex<Vec<Box<dyn EntropySource>>>>;

/// Owns the source lists and starts poll workers over them.
pub struct Collector {
    files: Arc<[SourceDescriptor]>,
    urls: Arc<[SourceDescriptor]>,
    programs: Arc<[SourceDescriptor]>,
    others: SharedSources,
    cancel: Arc<AtomicBool>,
}

impl Collector {
    pub fn new(
        files: Vec<SourceDescriptor>,
        urls: Vec<SourceDescriptor>,
        programs: Vec<SourceDescriptor>,
        others: Vec<Box<dyn EntropySource>>,
    ) -> Self {
        Self {
            files: files.into(),
            urls: urls.into(),
            programs: programs.into(),
            others: Arc::new(Mutex::new(others)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel flag shared by every worker this collector starts. Setting it
    /// stops the running worker without going through its [`PollHandle`];
    /// [`Collector::start`] clears it.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Total number of configured sources.
    pub fn source_count(&self) -> usize {
        let others = self.others.lock().unwrap_or_else(PoisonError::into_inner).len();
        self.files.len() + self.urls.len() + self.programs.len() + others
    }

    /// Spawns a worker. `initial_quality` is the pool quality at start; the
    /// worker stops once its credits bring that to 100.
    ///
    /// Returns `None` if the thread could not be spawned.
    pub fn start(&self, initial_quality: f64) -> Option<PollHandle> {
        let (sender, receiver) = mpsc::channel();
        let cancel = Arc::clone(&self.cancel);
        cancel.store(false, Ordering::Relaxed);

        let worker = Worker {
            files: Arc::clone(&self.files),
            urls: Arc::clone(&self.urls),
            programs: Arc::clone(&self.programs),
            others: Arc::clone(&self.others),
            cancel: Arc::clone(&cancel),
            sender,
            credited: initial_quality,
        };

        match thread::Builder::new()
            .name("csprng-poller".into())
            .spawn(move || worker.run())
        {
            Ok(thread) => {
                log::info!("Slow poll started at quality {:.1}", initial_quality);
                Some(PollHandle {
                    receiver,
                    cancel,
                    disconnected: Cell::new(false),
                    thread: Some(thread),
                    state: PollState::Running,
                })
            }
            Err(e) => {
                log::error!("Failed to spawn slow poll worker: {}", e);
                None
            }
        }
    }
}

/// Handle on a running (or finished) poll worker.
pub struct PollHandle {
    receiver: Receiver<Harvest>,
    cancel: Arc<AtomicBool>,
    /// Set once the worker dropped its sender; it is about to exit.
    disconnected: Cell<bool>,
    thread: Option<JoinHandle<PollState>>,
    state: PollState,
}

impl PollHandle {
    /// Next harvest if one is ready.
    pub fn try_next(&self) -> Option<Harvest> {
        match self.receiver.try_recv() {
            Ok(harvest) => Some(harvest),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.disconnected.set(true);
                None
            }
        }
    }

    /// Waits for the next harvest, the end of the poll, or `deadline`.
    pub fn wait(&self, deadline: Option<Instant>) -> Wait {
        let received = match deadline {
            None => self.receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                self.receiver.recv_timeout(timeout)
            }
        };
        match received {
            Ok(harvest) => Wait::Harvest(harvest),
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected.set(true);
                Wait::Finished
            }
            Err(RecvTimeoutError::Timeout) => Wait::TimedOut,
        }
    }

    /// True once the worker thread has exited or has delivered its last harvest.
    pub fn is_finished(&self) -> bool {
        self.disconnected.get() || self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Asks the worker to stop after the source it is reading. Entropy already
    /// delivered stays in the pool.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Current state; collects the worker result once it has exited.
    pub fn state(&mut self) -> PollState {
        if self.is_finished() {
            if let Some(thread) = self.thread.take() {
                self.state = thread.join().unwrap_or(PollState::Stopped);
                log::info!("Slow poll finished: {:?}", self.state);
            }
        }
        self.state
    }
}

struct Worker {
    files: Arc<[SourceDescriptor]>,
    urls: Arc<[SourceDescriptor]>,
    programs: Arc<[SourceDescriptor]>,
    others: SharedSources,
    cancel: Arc<AtomicBool>,
    sender: Sender<Harvest>,
    credited: f64,
}

impl Worker {
    fn run(mut self) -> PollState {
        let files = Arc::clone(&self.files);
        let urls = Arc::clone(&self.urls);
        let programs = Arc::clone(&self.programs);
        let mut lists = [files.iter(), urls.iter(), programs.iter()];
        let other_count = self.others.lock().unwrap_or_else(PoisonError::into_inner).len();
        let mut next_other = 0;

        loop {
            let mut visited = false;

            for list in lists.iter_mut() {
                if let Some(state) = self.should_stop() {
                    return state;
                }
                if let Some(descriptor) = list.next() {
                    visited = true;
                    if !self.poll_descriptor(descriptor) {
                        return PollState::Stopped;
                    }
                }
            }

            if let Some(state) = self.should_stop() {
                return state;
            }
            if next_other < other_count {
                visited = true;
                if !self.poll_other(next_other) {
                    return PollState::Stopped;
                }
                next_other += 1;
            }

            if !visited {
                return self.should_stop().unwrap_or(PollState::Exhausted);
            }
        }
    }

    fn should_stop(&self) -> Option<PollState> {
        if self.cancel.load(Ordering::Relaxed) {
            Some(PollState::Stopped)
        } else if self.credited >= MAX_QUALITY {
            Some(PollState::Satisfied)
        } else {
            None
        }
    }

    /// Returns false once the receiving side is gone.
    fn poll_descriptor(&mut self, descriptor: &SourceDescriptor) -> bool {
        match read_source(descriptor) {
            Ok(bytes) => {
                let quality = descriptor.credit(bytes.len());
                log::debug!("Read {} bytes from {}", bytes.len(), descriptor);
                self.deliver(Zeroizing::new(bytes), quality)
            }
            Err(e) => {
                log::debug!("Skipping entropy source {}: {}", descriptor, e);
                true
            }
        }
    }

    fn poll_other(&mut self, index: usize) -> bool {
        let polled = {
            let mut others = self.others.lock().unwrap_or_else(PoisonError::into_inner);
            others.get_mut(index).map(|source| {
                let name = source.name().to_string();
                (name, source.next_bytes(), source.quality())
            })
        };
        match polled {
            Some((name, Ok(bytes), quality)) => {
                log::debug!("Read {} bytes from custom source {}", bytes.len(), name);
                self.deliver(Zeroizing::new(bytes), quality)
            }
            Some((name, Err(e), _)) => {
                log::debug!("Skipping custom source {}: {}", name, e);
                true
            }
            None => true,
        }
    }

    fn deliver(&mut self, bytes: Zeroizing<Vec<u8>>, quality: f64) -> bool {
        if bytes.is_empty() {
            return true;
        }
        if self.credited < MAX_QUALITY && quality.is_finite() && quality > 0.0 {
            self.credited = (self.credited + quality).min(MAX_QUALITY);
        }
        self.sender.send(Harvest { bytes, quality }).is_ok()
    }
}
