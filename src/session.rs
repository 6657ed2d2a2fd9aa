//! Monitored-person session: one actor task per device.
//!
//! Sensor callbacks, UI actions and countdown expiries all arrive as messages
//! on the actor's channels, so arbitration and transitions never interleave.
//! Callers hold a cloneable [`SessionHandle`]; presentation code reads the
//! `watch` of [`SessionStatus`] and never touches the state machine directly.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};

use crate::alert::{
    AlertSink, Notification, Priority, FALL_WARNING_PATTERN, SOS_WARNING_PATTERN,
};
use crate::arbiter::{ArbiterStats, Decision, DetectionArbiter, Signal, SignalKind};
use crate::config::{DetectionConfig, SessionOptions};
use crate::error::{SResult, SafeNestError};
use crate::household::{normalize_code, HouseholdDirectory};
use crate::state_machine::{EmergencyKind, EmergencyState, EmergencyStateMachine, Transition};
use crate::store::{self, SharedStore};
use crate::sync::{LocalMirror, StatusPublisher};
use crate::timer::CountdownTimer;
use crate::types::{ActivityKind, EmergencyTag, Location, StatusSnapshot, Vitals};

const COMMAND_CAPACITY: usize = 64;
const LOW_BATTERY_PERCENT: u8 = 20;

/// Read-only view of the session for presentation layers.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub state: EmergencyState,
    pub tag: EmergencyTag,
    pub generation: u64,
    /// Generation and length of the live countdown, if any.
    pub countdown: Option<(u64, Duration)>,
    pub countdown_armed: bool,
    pub enabled_sources: Vec<SignalKind>,
    pub last_decision: Option<(SignalKind, Decision)>,
    pub publish_pending: bool,
    pub last_publish_error: Option<String>,
    pub stats: ArbiterStats,
    pub closed: bool,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            state: EmergencyState::Idle,
            tag: EmergencyTag::Normal,
            generation: 0,
            countdown: None,
            countdown_armed: false,
            enabled_sources: SignalKind::ALL.to_vec(),
            last_decision: None,
            publish_pending: false,
            last_publish_error: None,
            stats: ArbiterStats::default(),
            closed: false,
        }
    }
}

pub enum SessionCommand {
    Report {
        signal: Signal,
        reply: Option<oneshot::Sender<Decision>>,
    },
    Cancel(oneshot::Sender<SResult<()>>),
    Confirm(oneshot::Sender<SResult<()>>),
    MarkSafe(oneshot::Sender<SResult<()>>),
    ToggleSource {
        kind: SignalKind,
        enabled: bool,
        reply: oneshot::Sender<SResult<()>>,
    },
    SourceUnavailable {
        kind: SignalKind,
        reason: String,
        reply: oneshot::Sender<SResult<()>>,
    },
    UpdateLocation(Location),
    UpdateVitals(Vitals),
    RecordActivity {
        kind: ActivityKind,
        title: String,
        details: Option<String>,
    },
    CallEmergency(oneshot::Sender<()>),
    SignOut(oneshot::Sender<()>),
}

/// Capability handle onto a running session.
#[derive(Clone)]
pub struct SessionHandle {
    code: String,
    tx: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn code(&self) -> &str {
        &self.code
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SafeNestError::SessionClosed)?;
        rx.await.map_err(|_| SafeNestError::SessionClosed)
    }

    pub async fn report(&self, signal: Signal) -> SResult<Decision> {
        self.request(|reply| SessionCommand::Report {
            signal,
            reply: Some(reply),
        })
        .await
    }

    /// Fire-and-forget report for callers that cannot await (platform listeners).
    pub fn try_report(&self, signal: Signal) -> SResult<()> {
        self.tx
            .try_send(SessionCommand::Report {
                signal,
                reply: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Closed(_) => SafeNestError::SessionClosed,
                mpsc::error::TrySendError::Full(_) => {
                    SafeNestError::Internal("session command queue full".to_string())
                }
            })
    }

    pub async fn cancel(&self) -> SResult<()> {
        self.request(SessionCommand::Cancel).await?
    }

    pub async fn confirm(&self) -> SResult<()> {
        self.request(SessionCommand::Confirm).await?
    }

    pub async fn mark_safe(&self) -> SResult<()> {
        self.request(SessionCommand::MarkSafe).await?
    }

    pub async fn toggle_source(&self, kind: SignalKind, enabled: bool) -> SResult<()> {
        self.request(|reply| SessionCommand::ToggleSource {
            kind,
            enabled,
            reply,
        })
        .await?
    }

    /// A source lost its permission or hardware. Manual SOS cannot be lost.
    pub async fn source_unavailable(&self, kind: SignalKind, reason: &str) -> SResult<()> {
        let reason = reason.to_string();
        self.request(|reply| SessionCommand::SourceUnavailable {
            kind,
            reason,
            reply,
        })
        .await?
    }

    pub async fn update_location(&self, location: Location) -> SResult<()> {
        self.tx
            .send(SessionCommand::UpdateLocation(location))
            .await
            .map_err(|_| SafeNestError::SessionClosed)
    }

    pub async fn update_vitals(&self, vitals: Vitals) -> SResult<()> {
        self.tx
            .send(SessionCommand::UpdateVitals(vitals))
            .await
            .map_err(|_| SafeNestError::SessionClosed)
    }

    /// Appends an entry to the recent-activity log and publishes it.
    pub async fn record_activity(
        &self,
        kind: ActivityKind,
        title: &str,
        details: Option<&str>,
    ) -> SResult<()> {
        self.tx
            .send(SessionCommand::RecordActivity {
                kind,
                title: title.to_string(),
                details: details.map(str::to_string),
            })
            .await
            .map_err(|_| SafeNestError::SessionClosed)
    }

    pub async fn call_emergency(&self) -> SResult<()> {
        self.request(SessionCommand::CallEmergency).await
    }

    /// Forces Idle, clears the remote tag and stops the actor.
    pub async fn sign_out(&self) -> SResult<()> {
        self.request(SessionCommand::SignOut).await
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct MonitoredSession<S: SharedStore> {
    options: SessionOptions,
    arbiter: DetectionArbiter,
    machine: EmergencyStateMachine,
    timer: CountdownTimer,
    timer_tx: mpsc::UnboundedSender<u64>,
    snapshot: StatusSnapshot,
    publisher: StatusPublisher<S>,
    mirror: Option<LocalMirror>,
    sink: Arc<dyn AlertSink>,
    status_tx: watch::Sender<SessionStatus>,
    last_decision: Option<(SignalKind, Decision)>,
    closed: bool,
}

impl<S: SharedStore> MonitoredSession<S> {
    /// Checks membership, publishes the initial Normal status and spawns the
    /// actor. Must be called inside a tokio runtime.
    pub fn start(
        directory: &HouseholdDirectory<S>,
        code: &str,
        config: &DetectionConfig,
        options: SessionOptions,
        sink: Arc<dyn AlertSink>,
        mirror: Option<LocalMirror>,
    ) -> SResult<SessionHandle> {
        let code = normalize_code(code)?;
        config.validate()?;
        if !directory.validate(&code) {
            return Err(SafeNestError::NotFound(format!("household {}", code)));
        }
        match directory.monitored_person(&code)? {
            Some(member) if member.id == options.member_id => {}
            Some(member) => {
                return Err(SafeNestError::Conflict {
                    existing_name: member.name,
                })
            }
            None => {
                return Err(SafeNestError::NotFound(format!(
                    "monitored person for {}",
                    code
                )))
            }
        }

        let store = directory.store();
        let mut publisher = StatusPublisher::new(store.clone(), &code);
        let mut snapshot = StatusSnapshot::new(&options.member_id, &options.member_name);
        match store.get(&store::status_path(&code)) {
            Ok(Some(value)) => match serde_json::from_value::<StatusSnapshot>(value) {
                Ok(previous) => {
                    publisher.resume_after(previous.sequence);
                    snapshot.location = previous.location;
                    snapshot.vitals = previous.vitals;
                    snapshot.recent_activity = previous.recent_activity;
                    snapshot.is_fall_detection_enabled = previous.is_fall_detection_enabled;
                    snapshot.is_location_sharing_enabled = previous.is_location_sharing_enabled;
                    snapshot.recent_activity.push(
                        ActivityKind::Info,
                        "System Active",
                        Some("SafeNest monitoring started"),
                    );
                }
                Err(e) => warn!("[SYNC] ignoring unreadable status for {}: {}", code, e),
            },
            Ok(None) => {}
            Err(e) => warn!("[SYNC] could not read previous status for {}: {}", code, e),
        }

        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::initial());

        let mut session = MonitoredSession {
            arbiter: DetectionArbiter::new(config),
            machine: EmergencyStateMachine::new(config),
            timer: CountdownTimer::new(),
            timer_tx,
            snapshot,
            publisher,
            mirror,
            sink,
            status_tx,
            last_decision: None,
            closed: false,
            options,
        };
        if !session.snapshot.is_fall_detection_enabled {
            let _ = session.arbiter.toggle_source(SignalKind::FallImpact, false);
        }
        session.publish();
        info!(
            "[STATE] session started for {} in {}",
            session.options.member_name, code
        );

        tokio::spawn(session.run(rx, timer_rx));
        Ok(SessionHandle {
            code,
            tx,
            status: status_rx,
        })
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionCommand>,
        mut timer_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SessionCommand::SignOut(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        debug!("[STATE] all handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(generation) = timer_rx.recv() => self.on_countdown_expired(generation),
            }
            self.refresh_status();
        }
        self.refresh_status();
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Report { signal, reply } => {
                let decision = self.on_signal(signal);
                if let Some(reply) = reply {
                    let _ = reply.send(decision);
                }
            }
            SessionCommand::Cancel(reply) => {
                let _ = reply.send(self.on_cancel());
            }
            SessionCommand::Confirm(reply) => {
                let result = self.machine.confirm().map(|t| self.on_active(t));
                let _ = reply.send(result);
            }
            SessionCommand::MarkSafe(reply) => {
                let _ = reply.send(self.on_mark_safe());
            }
            SessionCommand::ToggleSource {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.on_toggle(kind, enabled));
            }
            SessionCommand::SourceUnavailable {
                kind,
                reason,
                reply,
            } => {
                let _ = reply.send(self.on_source_unavailable(kind, &reason));
            }
            SessionCommand::UpdateLocation(location) => {
                if self.snapshot.is_location_sharing_enabled {
                    self.snapshot.location = location;
                    self.publish();
                }
            }
            SessionCommand::UpdateVitals(vitals) => self.on_vitals(vitals),
            SessionCommand::RecordActivity {
                kind,
                title,
                details,
            } => {
                self.snapshot
                    .recent_activity
                    .push(kind, &title, details.as_deref());
                self.publish();
            }
            SessionCommand::CallEmergency(reply) => {
                self.dial_emergency();
                self.publish();
                let _ = reply.send(());
            }
            SessionCommand::SignOut(reply) => {
                // Handled in run(); kept exhaustive.
                let _ = reply.send(());
            }
        }
    }

    fn on_signal(&mut self, signal: Signal) -> Decision {
        let now = Instant::now();
        let decision = self.arbiter.report(&signal, self.machine.state(), now);
        self.last_decision = Some((signal.kind, decision));
        if !decision.is_accepted() {
            return decision;
        }

        let kind = signal.kind.warning();
        let countdown = match self.machine.enter_warning(kind, now) {
            Ok(countdown) => countdown,
            Err(e) => {
                error!("[STATE] accepted signal could not open a warning: {}", e);
                return decision;
            }
        };
        self.timer.arm(
            countdown.generation,
            countdown.duration,
            self.timer_tx.clone(),
            countdown.generation,
        );

        let title = match kind {
            EmergencyKind::Fall => "Possible Fall Detected",
            EmergencyKind::Sos => "SOS Triggered",
        };
        self.snapshot
            .recent_activity
            .push(ActivityKind::Emergency, title, Some(&signal.describe()));
        self.warn_locally(kind, countdown.duration);

        // Warnings stay on the device until confirmed.
        self.mirror_locally();
        decision
    }

    fn warn_locally(&self, kind: EmergencyKind, countdown: Duration) {
        let secs = countdown.as_secs();
        match kind {
            EmergencyKind::Fall => {
                self.sink.vibrate(&FALL_WARNING_PATTERN);
                self.sink.show_notification(
                    Notification::new(
                        "Fall Detected",
                        &format!("Are you OK? Alerting caregivers in {}s", secs),
                        Priority::Max,
                    )
                    .with_actions(&["I am OK", "Send Alert"]),
                );
            }
            EmergencyKind::Sos => {
                self.sink.vibrate(&SOS_WARNING_PATTERN);
                self.sink.play_siren(true);
                self.sink.show_notification(
                    Notification::new(
                        "SOS Countdown",
                        &format!("Sending emergency alert in {}s", secs),
                        Priority::Max,
                    )
                    .with_actions(&["Cancel"]),
                );
            }
        }
    }

    fn silence_locally(&self) {
        self.sink.stop_siren();
        self.sink.vibrate(&[]);
    }

    fn on_cancel(&mut self) -> SResult<()> {
        self.machine.cancel()?;
        self.timer.disarm();
        self.silence_locally();
        self.snapshot.recent_activity.push(
            ActivityKind::Info,
            "Alert Cancelled",
            Some("User responded: I am OK"),
        );
        self.publish();
        Ok(())
    }

    fn on_countdown_expired(&mut self, generation: u64) {
        match self.machine.expire(generation) {
            Some(transition) => self.on_active(transition),
            None => debug!("[STATE] countdown gen {} fired after leaving its warning", generation),
        }
    }

    fn on_active(&mut self, transition: Transition) {
        self.timer.disarm();
        let EmergencyState::Active(kind) = transition.to else {
            return;
        };

        let (title, details) = match kind {
            EmergencyKind::Fall => ("FALL DETECTED", "Caregivers notified of a fall"),
            EmergencyKind::Sos => ("SOS ACTIVATED", "Caregivers notified"),
        };
        self.snapshot
            .recent_activity
            .push(ActivityKind::Emergency, title, Some(details));
        self.publish();

        self.sink.play_siren(true);
        self.sink.show_notification(Notification::new(
            "Emergency Alert Sent",
            "Your caregivers have been notified",
            Priority::Max,
        ));
        if self.options.auto_dial {
            self.dial_emergency();
            self.publish();
        }
    }

    fn on_mark_safe(&mut self) -> SResult<()> {
        self.machine.mark_safe()?;
        self.silence_locally();
        self.snapshot.recent_activity.push(
            ActivityKind::Info,
            "Marked Safe",
            Some("Emergency resolved by user"),
        );
        self.publish();
        Ok(())
    }

    fn on_toggle(&mut self, kind: SignalKind, enabled: bool) -> SResult<()> {
        self.arbiter.toggle_source(kind, enabled)?;
        if kind == SignalKind::FallImpact && self.snapshot.is_fall_detection_enabled != enabled {
            self.snapshot.is_fall_detection_enabled = enabled;
            self.publish();
        }
        Ok(())
    }

    fn on_source_unavailable(&mut self, kind: SignalKind, reason: &str) -> SResult<()> {
        if !kind.can_disable() {
            return Err(SafeNestError::SourceUnavailable(format!(
                "{} reported unavailable but stays enabled",
                kind
            )));
        }
        warn!("[STATE] {} unavailable: {}", kind, reason);
        self.arbiter.toggle_source(kind, false)?;
        if kind == SignalKind::FallImpact {
            self.snapshot.is_fall_detection_enabled = false;
        }
        self.snapshot.recent_activity.push(
            ActivityKind::Info,
            "Sensor Unavailable",
            Some(&format!("{}: {}", kind, reason)),
        );
        self.publish();
        Ok(())
    }

    fn on_vitals(&mut self, vitals: Vitals) {
        let was = self.snapshot.vitals.battery_level;
        if was >= LOW_BATTERY_PERCENT && vitals.battery_level < LOW_BATTERY_PERCENT {
            self.snapshot.recent_activity.push(
                ActivityKind::Battery,
                "Low Battery",
                Some(&format!("{}% remaining", vitals.battery_level)),
            );
        }
        self.snapshot.vitals = vitals;
        self.publish();
    }

    fn dial_emergency(&mut self) {
        let number = self.options.emergency_number.clone();
        self.sink.dial(&number);
        self.snapshot.recent_activity.push(
            ActivityKind::Emergency,
            "Emergency Call",
            Some(&format!("Dialing {}", number)),
        );
    }

    fn shutdown(&mut self) {
        self.timer.disarm();
        if self.machine.reset().is_some() {
            self.silence_locally();
        }
        self.snapshot
            .recent_activity
            .push(ActivityKind::Info, "Signed Out", None);
        self.publish();
        self.closed = true;
        info!("[STATE] session for {} closed", self.publisher.code());
    }

    fn mirror_locally(&self) {
        if let Some(mirror) = &self.mirror {
            mirror.publish(&self.snapshot);
        }
    }

    /// The remote tag is always derived from the state machine.
    fn publish(&mut self) {
        self.snapshot.status = self.machine.state().tag();
        self.publisher.publish(&mut self.snapshot);
        self.mirror_locally();
    }

    fn refresh_status(&self) {
        let status = SessionStatus {
            state: self.machine.state(),
            tag: self.machine.state().tag(),
            generation: self.machine.generation(),
            countdown: self.machine.countdown().map(|c| (c.generation, c.duration)),
            countdown_armed: self.timer.is_armed(),
            enabled_sources: self.arbiter.enabled_sources(),
            last_decision: self.last_decision,
            publish_pending: self.publisher.is_pending(),
            last_publish_error: self.publisher.last_error().map(str::to_string),
            stats: self.arbiter.stats(),
            closed: self.closed,
        };
        self.status_tx.send_replace(status);
    }
}
