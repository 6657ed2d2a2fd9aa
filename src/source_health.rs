use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};

use crate::arbiter::SignalKind;
use crate::session::SessionHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    Unknown,
}

/// Liveness and permission for one signal source.
#[derive(Clone, Debug)]
pub struct SourceHealth {
    pub kind: SignalKind,
    pub last_sample: Arc<Mutex<Instant>>,
    /// `None` for event-only sources (buttons, taps) that are never "silent".
    pub silence_threshold: Option<Duration>,
    pub permission: Arc<Mutex<Permission>>,
}

impl SourceHealth {
    pub fn new(kind: SignalKind, silence_threshold: Option<Duration>) -> Self {
        SourceHealth {
            kind,
            last_sample: Arc::new(Mutex::new(Instant::now())),
            silence_threshold,
            permission: Arc::new(Mutex::new(Permission::Unknown)),
        }
    }

    pub fn update(&self) {
        if let Ok(mut time) = self.last_sample.lock() {
            *time = Instant::now();
        }
    }

    pub fn time_since_last_sample(&self) -> Option<Duration> {
        self.last_sample.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        match self.silence_threshold {
            Some(threshold) => self
                .time_since_last_sample()
                .map(|d| d > threshold)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn set_permission(&self, permission: Permission) {
        if let Ok(mut p) = self.permission.lock() {
            *p = permission;
        }
    }

    pub fn permission(&self) -> Permission {
        self.permission
            .lock()
            .map(|p| *p)
            .unwrap_or(Permission::Unknown)
    }

    pub fn is_usable(&self) -> bool {
        self.permission() != Permission::Denied && !self.is_silent()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceReport {
    pub kind: SignalKind,
    pub permission: Permission,
    pub silent_for: Option<Duration>,
}

impl SourceReport {
    pub fn healthy(&self) -> bool {
        self.permission != Permission::Denied && self.silent_for.is_none()
    }
}

/// Health of every signal source feeding one session.
pub struct SourceHealthMonitor {
    sources: HashMap<SignalKind, SourceHealth>,
    check_interval: Duration,
}

impl SourceHealthMonitor {
    pub fn new() -> Self {
        // Sampled sources: accelerometer at ~50 Hz, microphone at ~10 Hz.
        let mut sources = HashMap::new();
        for kind in SignalKind::ALL {
            let silence = match kind {
                SignalKind::FallImpact => Some(Duration::from_secs(5)),
                SignalKind::SustainedLoudSound => Some(Duration::from_secs(5)),
                _ => None,
            };
            sources.insert(kind, SourceHealth::new(kind, silence));
        }
        SourceHealthMonitor {
            sources,
            check_interval: Duration::from_secs(2),
        }
    }

    pub fn source(&self, kind: SignalKind) -> Option<&SourceHealth> {
        self.sources.get(&kind)
    }

    pub fn sample(&self, kind: SignalKind) {
        if let Some(source) = self.sources.get(&kind) {
            source.update();
        }
    }

    /// Records a permission result. Returns true when the source has just
    /// become unusable and the session should disable it.
    pub fn record_permission(&self, kind: SignalKind, permission: Permission) -> bool {
        let Some(source) = self.sources.get(&kind) else {
            return false;
        };
        let before = source.permission();
        source.set_permission(permission);
        permission == Permission::Denied && before != Permission::Denied && kind.can_disable()
    }

    pub fn check(&self) -> Vec<SourceReport> {
        let mut reports: Vec<SourceReport> = self
            .sources
            .values()
            .map(|s| SourceReport {
                kind: s.kind,
                permission: s.permission(),
                silent_for: if s.is_silent() {
                    s.time_since_last_sample()
                } else {
                    None
                },
            })
            .collect();
        reports.sort_by_key(|r| SignalKind::ALL.iter().position(|k| *k == r.kind));
        reports
    }

    pub fn format_status(&self) -> String {
        let parts: Vec<String> = self
            .check()
            .iter()
            .filter(|r| self.sources.get(&r.kind).and_then(|s| s.silence_threshold).is_some())
            .map(|r| {
                let mark = if r.healthy() {
                    "✓".to_string()
                } else if r.permission == Permission::Denied {
                    "✗ (denied)".to_string()
                } else {
                    format!(
                        "⚠ (silent {:.1}s)",
                        r.silent_for.unwrap_or_default().as_secs_f64()
                    )
                };
                format!("{} {}", r.kind, mark)
            })
            .collect();
        format!("Sources: {} | SOS button ✓", parts.join(" | "))
    }
}

impl Default for SourceHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically logs silent sources. Denied ones are reported to the session
/// once so the arbiter stops accepting them; manual SOS is never touched.
pub async fn source_health_task(monitor: Arc<SourceHealthMonitor>, session: SessionHandle) {
    let mut reported: HashMap<SignalKind, bool> = HashMap::new();
    loop {
        sleep(monitor.check_interval).await;
        if session.is_closed() {
            break;
        }

        for report in monitor.check() {
            if let Some(duration) = report.silent_for {
                warn!(
                    "[HEALTH] ⚠️ {} SILENT for {:.1}s",
                    report.kind,
                    duration.as_secs_f64()
                );
            }
            if report.permission == Permission::Denied
                && report.kind.can_disable()
                && !reported.get(&report.kind).copied().unwrap_or(false)
            {
                reported.insert(report.kind, true);
                match session
                    .source_unavailable(report.kind, "permission denied")
                    .await
                {
                    Ok(()) => info!("[HEALTH] {} disabled, other sources stay active", report.kind),
                    Err(e) => warn!("[HEALTH] could not disable {}: {}", report.kind, e),
                }
            }
        }
    }
}
