use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Byte-level progress for everything one batch pushes out, shared by
/// the per-file upload streams and the typing broadcaster. Counters only
/// ever grow; percent is clamped so a retried upload cannot overshoot.
#[derive(Debug, Default)]
pub struct Tracker {
    total: AtomicU64,
    uploaded: AtomicU64,
}

impl Tracker {
    /// Registers a child's size into the batch total.
    pub fn expect(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn percent(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let uploaded = self.uploaded.load(Ordering::Relaxed).min(total);
        uploaded * 100 / total
    }

    pub fn done(&self) -> bool {
        self.percent() == 100
    }
}

/// The tracker of the batch currently uploading, if any; read by the
/// status command from outside the job task.
#[derive(Debug, Clone, Default)]
pub struct UploadStatus {
    current: Arc<Mutex<Option<Arc<Tracker>>>>,
}

impl UploadStatus {
    pub fn begin(&self, tracker: Arc<Tracker>) {
        *self.current.lock().unwrap() = Some(tracker);
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }

    pub fn percent(&self) -> Option<u64> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|tracker| tracker.percent())
    }
}
