//! Device-side alert outputs. Sinks hold no emergency state of their own.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Sustained pattern for a fall warning.
pub const FALL_WARNING_PATTERN: [u64; 5] = [500, 200, 500, 200, 500];
/// Short bursts for an SOS warning.
pub const SOS_WARNING_PATTERN: [u64; 5] = [100, 50, 100, 50, 100];
/// Caregiver-side emergency pattern.
pub const CAREGIVER_ALARM_PATTERN: [u64; 7] = [500, 200, 500, 200, 500, 200, 1000];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Default,
    High,
    Max,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: Priority,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Notification {
    pub fn new(title: &str, body: &str, priority: Priority) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            priority,
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|a| a.to_string()).collect();
        self
    }
}

pub trait AlertSink: Send + Sync {
    /// Millisecond on/off durations. An empty pattern cancels vibration.
    fn vibrate(&self, pattern: &[u64]);
    fn play_siren(&self, looping: bool);
    fn stop_siren(&self);
    fn show_notification(&self, notification: Notification);
    fn dial(&self, number: &str);
}

/// Writes every call to the log. Used by the simulator binary.
pub struct LogAlertSink {
    label: String,
}

impl LogAlertSink {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

impl AlertSink for LogAlertSink {
    fn vibrate(&self, pattern: &[u64]) {
        if pattern.is_empty() {
            info!("[{}] vibration off", self.label);
        } else {
            info!("[{}] vibrate {:?}", self.label, pattern);
        }
    }

    fn play_siren(&self, looping: bool) {
        warn!("[{}] 🔊 SIREN{}", self.label, if looping { " (loop)" } else { "" });
    }

    fn stop_siren(&self) {
        info!("[{}] siren stopped", self.label);
    }

    fn show_notification(&self, notification: Notification) {
        info!(
            "[{}] notify {:?} \"{}\": {}",
            self.label,
            notification.priority,
            notification.title,
            notification.body.replace('\n', " | ")
        );
    }

    fn dial(&self, number: &str) {
        warn!("[{}] 📞 dialing {}", self.label, number);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AlertCall {
    Vibrate(Vec<u64>),
    PlaySiren { looping: bool },
    StopSiren,
    Notify(Notification),
    Dial(String),
}

/// Records calls in order so tests can assert exact side effects.
#[derive(Default)]
pub struct RecordingAlertSink {
    calls: Mutex<Vec<AlertCall>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: AlertCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<AlertCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn siren_starts(&self) -> usize {
        self.count(|c| matches!(c, AlertCall::PlaySiren { .. }))
    }

    pub fn siren_stops(&self) -> usize {
        self.count(|c| matches!(c, AlertCall::StopSiren))
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AlertCall::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn dials(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AlertCall::Dial(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn vibrations(&self) -> Vec<Vec<u64>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AlertCall::Vibrate(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&AlertCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

impl AlertSink for RecordingAlertSink {
    fn vibrate(&self, pattern: &[u64]) {
        self.record(AlertCall::Vibrate(pattern.to_vec()));
    }

    fn play_siren(&self, looping: bool) {
        self.record(AlertCall::PlaySiren { looping });
    }

    fn stop_siren(&self) {
        self.record(AlertCall::StopSiren);
    }

    fn show_notification(&self, notification: Notification) {
        self.record(AlertCall::Notify(notification));
    }

    fn dial(&self, number: &str) {
        self.record(AlertCall::Dial(number.to_string()));
    }
}
