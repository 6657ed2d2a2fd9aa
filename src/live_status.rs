use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::arbiter::SignalKind;
use crate::session::SessionStatus;
use crate::source_health::{Permission, SourceReport};

/// Periodic dump of the simulator's state, for a dashboard or `jq`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub household: String,
    // Session
    pub state: String,
    pub remote_tag: String,
    pub generation: u64,
    pub countdown_armed: bool,
    pub countdown_secs: Option<u64>,
    pub publish_pending: bool,
    pub last_publish_error: Option<String>,
    // Arbiter
    pub signals_accepted: u64,
    pub suppressed_already_active: u64,
    pub suppressed_source_disabled: u64,
    pub suppressed_cooldown: u64,
    // Leaf sources
    pub accel_samples: u64,
    pub sound_samples: u64,
    pub button_presses: u64,
    /// Near-still accelerometer samples right after the last impact.
    pub impact_still_samples: u32,
    pub accel_healthy: bool,
    pub mic_healthy: bool,
    pub mic_permission_denied: bool,
    // Caregiver side
    pub caregiver_tag: String,
    pub caregiver_alarm: String,
}

impl LiveStatus {
    pub fn new(household: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            household: household.to_string(),
            state: "Idle".to_string(),
            remote_tag: "Normal".to_string(),
            generation: 0,
            countdown_armed: false,
            countdown_secs: None,
            publish_pending: false,
            last_publish_error: None,
            signals_accepted: 0,
            suppressed_already_active: 0,
            suppressed_source_disabled: 0,
            suppressed_cooldown: 0,
            accel_samples: 0,
            sound_samples: 0,
            button_presses: 0,
            impact_still_samples: 0,
            accel_healthy: true,
            mic_healthy: true,
            mic_permission_denied: false,
            caregiver_tag: "Normal".to_string(),
            caregiver_alarm: "None".to_string(),
        }
    }

    pub fn apply_session(&mut self, status: &SessionStatus) {
        self.timestamp = current_timestamp();
        self.state = status.state.to_string();
        self.remote_tag = format!("{:?}", status.tag);
        self.generation = status.generation;
        self.countdown_armed = status.countdown_armed;
        self.countdown_secs = status.countdown.map(|(_, d)| d.as_secs());
        self.publish_pending = status.publish_pending;
        self.last_publish_error = status.last_publish_error.clone();
        self.signals_accepted = status.stats.accepted;
        self.suppressed_already_active = status.stats.already_active;
        self.suppressed_source_disabled = status.stats.source_disabled;
        self.suppressed_cooldown = status.stats.cooldown;
    }

    pub fn apply_health(&mut self, reports: &[SourceReport]) {
        for report in reports {
            match report.kind {
                SignalKind::FallImpact => self.accel_healthy = report.healthy(),
                SignalKind::SustainedLoudSound => {
                    self.mic_healthy = report.healthy();
                    self.mic_permission_denied = report.permission == Permission::Denied;
                }
                _ => {}
            }
        }
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
