//! SafeNest emergency detection and household status synchronization.
//!
//! A monitored device runs one [`session::MonitoredSession`] per household:
//! detectors feed signals to the arbiter, the state machine runs the warning
//! countdown, and status snapshots are published to the shared store. Caregiver
//! devices follow those snapshots through [`caregiver::CaregiverSession`].

pub mod alert;
pub mod arbiter;
pub mod caregiver;
pub mod config;
pub mod detectors;
pub mod error;
pub mod household;
pub mod live_status;
pub mod mailbox;
pub mod reminders;
pub mod session;
pub mod source_health;
pub mod state_machine;
pub mod store;
pub mod sync;
pub mod timer;
pub mod types;

pub use arbiter::{Decision, Signal, SignalKind, SuppressReason};
pub use config::{DetectionConfig, SessionOptions};
pub use error::{SResult, SafeNestError};
pub use session::{MonitoredSession, SessionHandle, SessionStatus};
pub use state_machine::{EmergencyKind, EmergencyState};
pub use store::{MemoryStore, SharedStore};
pub use types::{EmergencyTag, StatusSnapshot};
