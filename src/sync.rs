//! Writer side of status synchronization, plus the same-device mirror.
//!
//! Publishing is best-effort: a failed write is logged and remembered as
//! pending. The next publish writes the whole snapshot again, which is the
//! only retry there is.

use chrono::Utc;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::error::SResult;
use crate::store::{self, SharedStore};
use crate::types::StatusSnapshot;

pub struct StatusPublisher<S: SharedStore> {
    store: Arc<S>,
    code: String,
    sequence: u64,
    pending: bool,
    last_error: Option<String>,
    published: u64,
    failed: u64,
}

impl<S: SharedStore> StatusPublisher<S> {
    pub fn new(store: Arc<S>, code: &str) -> Self {
        Self {
            store,
            code: code.to_string(),
            sequence: 0,
            pending: false,
            last_error: None,
            published: 0,
            failed: 0,
        }
    }

    /// Continue numbering after a sequence already in the store.
    pub fn resume_after(&mut self, sequence: u64) {
        self.sequence = self.sequence.max(sequence);
    }

    /// Stamps `sequence`/`last_update` and writes the snapshot. Returns
    /// whether the write landed; failures never propagate.
    pub fn publish(&mut self, snapshot: &mut StatusSnapshot) -> bool {
        self.sequence += 1;
        snapshot.sequence = self.sequence;
        // Never step backwards, even if the wall clock does.
        snapshot.last_update = Utc::now().max(snapshot.last_update);

        match self.write(snapshot) {
            Ok(()) => {
                if self.pending {
                    debug!("[SYNC] {} pending status flushed", self.code);
                }
                self.pending = false;
                self.last_error = None;
                self.published += 1;
                debug!(
                    "[SYNC] {} status {:?} seq {}",
                    self.code, snapshot.status, snapshot.sequence
                );
                true
            }
            Err(e) => {
                warn!("[SYNC] {} status write failed, will retry on next change: {}", self.code, e);
                self.pending = true;
                self.last_error = Some(e.to_string());
                self.failed += 1;
                false
            }
        }
    }

    fn write(&self, snapshot: &StatusSnapshot) -> SResult<()> {
        let value = serde_json::to_value(snapshot)?;
        self.store.set(&store::status_path(&self.code), value)?;
        Ok(())
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn published_count(&self) -> u64 {
        self.published
    }

    pub fn failed_count(&self) -> u64 {
        self.failed
    }
}

/// Same-device broadcast of the monitored person's snapshot so several local
/// surfaces agree without a store round trip. The store stays authoritative.
#[derive(Clone)]
pub struct LocalMirror {
    tx: broadcast::Sender<StatusSnapshot>,
    latest: Arc<Mutex<Option<StatusSnapshot>>>,
}

impl LocalMirror {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn publish(&self, snapshot: &StatusSnapshot) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(snapshot.clone());
        }
        // No receivers is fine.
        let _ = self.tx.send(snapshot.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    /// Last mirrored snapshot, for surfaces that attach late.
    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.latest.lock().ok().and_then(|l| l.clone())
    }
}

impl Default for LocalMirror {
    fn default() -> Self {
        Self::new(16)
    }
}
