/// Checkpoint marks and the background thread that drives checkpoints.
///
/// A [`CheckpointSource`] hands out marks and is told when a mark is durable.
/// A [`Checkpointer`] decides when to checkpoint; [`SyncThread`] does so on
/// demand and on a fixed interval.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{LedgerStorage, StorageError};

/// A durability boundary. Everything accepted before the mark was handed out
/// is persisted once the mark completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checkpoint(pub u64);

impl Checkpoint {
    /// Covers everything ever written.
    pub const MAX: Checkpoint = Checkpoint(u64::MAX);
}

pub trait CheckpointSource: Send + Sync {
    /// Returns a mark covering every write accepted so far.
    fn new_checkpoint(&self) -> Checkpoint;

    /// Records that everything up to `checkpoint` is durable.
    fn checkpoint_complete(&self, checkpoint: Checkpoint, compact: bool)
        -> Result<(), StorageError>;
}

pub trait Checkpointer: Send + Sync {
    /// Starts periodic checkpointing.
    fn start(&self);

    /// Asks for a checkpoint of `checkpoint` soon. Never blocks.
    fn start_checkpoint(&self, checkpoint: Checkpoint);
}

/// In-process source handing out increasing marks.
#[derive(Debug, Default)]
pub struct SequentialCheckpointSource {
    next: AtomicU64,
    last_complete: AtomicU64,
}

impl SequentialCheckpointSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest completed mark, `None` before the first completion.
    pub fn last_complete(&self) -> Option<Checkpoint> {
        match self.last_complete.load(Ordering::Acquire) {
            0 => None,
            n => Some(Checkpoint(n - 1)),
        }
    }
}

impl CheckpointSource for SequentialCheckpointSource {
    fn new_checkpoint(&self) -> Checkpoint {
        Checkpoint(self.next.fetch_add(1, Ordering::AcqRel))
    }

    fn checkpoint_complete(
        &self,
        checkpoint: Checkpoint,
        _compact: bool,
    ) -> Result<(), StorageError> {
        // stored off by one so that 0 means "nothing yet"
        self.last_complete
            .fetch_max(checkpoint.0.saturating_add(1), Ordering::AcqRel);
        Ok(())
    }
}

enum Request {
    Checkpoint(Checkpoint),
    Shutdown,
}

/// Background checkpoint thread.
///
/// Checkpoints run one at a time on the thread, either when asked through
/// [`Checkpointer::start_checkpoint`] or every `interval`. The storage is
/// held weakly so the thread never keeps it alive; once the storage is gone
/// the thread exits.
pub struct SyncThread {
    storage: Weak<dyn LedgerStorage>,
    source: Arc<dyn CheckpointSource>,
    interval: Duration,
    tx: Mutex<Sender<Request>>,
    rx: Mutex<Option<Receiver<Request>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncThread")
            .field("interval", &self.interval)
            .field("running", &self.handle.lock().is_some())
            .finish()
    }
}

impl SyncThread {
    pub fn new(
        storage: Weak<dyn LedgerStorage>,
        source: Arc<dyn CheckpointSource>,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            storage,
            source,
            interval,
            tx: Mutex::new(tx),
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    /// Runs a final checkpoint and stops the thread.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.tx.lock().send(Request::Shutdown);
        // the last storage reference may be dropped on the sync thread itself
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("sync thread panicked");
        }
    }
}

impl Checkpointer for SyncThread {
    fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            warn!("sync thread already started");
            return;
        };
        let storage = self.storage.clone();
        let source = self.source.clone();
        let interval = self.interval;

        let spawned = thread::Builder::new()
            .name("sync-thread".to_string())
            .spawn(move || run(rx, storage, source, interval));
        match spawned {
            Ok(handle) => {
                info!(interval_ms = interval.as_millis() as u64, "sync thread started");
                *self.handle.lock() = Some(handle);
            }
            Err(e) => error!(error = %e, "failed to spawn sync thread"),
        }
    }

    fn start_checkpoint(&self, checkpoint: Checkpoint) {
        if self.tx.lock().send(Request::Checkpoint(checkpoint)).is_err() {
            debug!(checkpoint = checkpoint.0, "sync thread gone, checkpoint dropped");
        }
    }
}

impl Drop for SyncThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    rx: Receiver<Request>,
    storage: Weak<dyn LedgerStorage>,
    source: Arc<dyn CheckpointSource>,
    interval: Duration,
) {
    loop {
        let (mark, last) = match rx.recv_timeout(interval) {
            Ok(Request::Checkpoint(mark)) => (mark, false),
            Err(RecvTimeoutError::Timeout) => (source.new_checkpoint(), false),
            Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                (source.new_checkpoint(), true)
            }
        };

        let Some(storage) = storage.upgrade() else {
            debug!("storage dropped, sync thread exiting");
            return;
        };
        match storage.checkpoint(mark) {
            Ok(done) => {
                if let Err(e) = source.checkpoint_complete(done, true) {
                    error!(checkpoint = done.0, error = %e, "failed to record checkpoint");
                }
            }
            Err(e) => error!(checkpoint = mark.0, error = %e, "checkpoint failed"),
        }
        if last {
            info!("sync thread stopped");
            return;
        }
    }
}
