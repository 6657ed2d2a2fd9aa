//! Single-slot handoff for SOS taps that arrive from platform listeners
//! (widget, lock screen) possibly before any session exists.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Mutex;

use crate::arbiter::{Signal, SignalKind};
use crate::error::{SResult, SafeNestError};
use crate::session::SessionHandle;
use crate::state_machine::EmergencyKind;

#[derive(Clone, Debug, PartialEq)]
pub struct SosRequest {
    pub kind: SignalKind,
    pub requested_at: DateTime<Utc>,
}

impl SosRequest {
    fn into_signal(self) -> Signal {
        let mut signal = Signal::new(self.kind);
        signal.details = Some(format!("queued at {}", self.requested_at.format("%H:%M:%S")));
        signal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Sent straight to the attached session.
    Forwarded,
    /// Parked in the slot until a session attaches.
    Stored,
    /// A request was already parked; the slot holds at most one.
    Coalesced,
}

enum Slot {
    Empty,
    Pending(SosRequest),
    Attached(SessionHandle),
}

pub struct SosMailbox {
    slot: Mutex<Slot>,
}

impl SosMailbox {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
        }
    }

    pub fn deposit(&self, kind: SignalKind) -> SResult<Delivery> {
        if kind.warning() != EmergencyKind::Sos {
            return Err(SafeNestError::InvalidInput(format!(
                "{} is not an SOS request",
                kind
            )));
        }
        let request = SosRequest {
            kind,
            requested_at: Utc::now(),
        };
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| SafeNestError::Internal("mailbox lock poisoned".to_string()))?;

        match &*slot {
            Slot::Attached(handle) => match handle.try_report(request.clone().into_signal()) {
                Ok(()) => return Ok(Delivery::Forwarded),
                Err(e) => {
                    warn!("[MAILBOX] attached session unreachable ({}), parking request", e);
                }
            },
            Slot::Pending(_) => return Ok(Delivery::Coalesced),
            Slot::Empty => {}
        }
        info!("[MAILBOX] {} parked until a session attaches", kind);
        *slot = Slot::Pending(request);
        Ok(Delivery::Stored)
    }

    /// Attaches a session and hands it the parked request, if any. The
    /// request is drained exactly once.
    pub fn attach(&self, handle: SessionHandle) -> SResult<Option<SosRequest>> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| SafeNestError::Internal("mailbox lock poisoned".to_string()))?;
        let previous = std::mem::replace(&mut *slot, Slot::Attached(handle.clone()));
        let Slot::Pending(request) = previous else {
            return Ok(None);
        };
        info!("[MAILBOX] draining parked {} into session {}", request.kind, handle.code());
        if let Err(e) = handle.try_report(request.clone().into_signal()) {
            *slot = Slot::Pending(request);
            return Err(e);
        }
        Ok(Some(request))
    }

    pub fn detach(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            if matches!(*slot, Slot::Attached(_)) {
                *slot = Slot::Empty;
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .map(|s| matches!(*s, Slot::Pending(_)))
            .unwrap_or(false)
    }

    pub fn is_attached(&self) -> bool {
        self.slot
            .lock()
            .map(|s| matches!(*s, Slot::Attached(_)))
            .unwrap_or(false)
    }
}

impl Default for SosMailbox {
    fn default() -> Self {
        Self::new()
    }
}
