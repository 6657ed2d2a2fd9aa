//! Reader side of status synchronization.
//!
//! [`CaregiverMonitor`] holds the per-household alarm logic and is driven one
//! delivery at a time. [`CaregiverSession`] wraps it in an actor that owns the
//! store subscriptions, one forwarder task per household.

use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::alert::{AlertSink, Notification, Priority, CAREGIVER_ALARM_PATTERN};
use crate::error::{SResult, SafeNestError};
use crate::household::{normalize_code, HouseholdDirectory, Memberships};
use crate::store::{self, SharedStore};
use crate::types::{EmergencyTag, Identity, Role, StatusSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmLevel {
    None,
    /// Lower-intensity notification for a household that is not active.
    Notified,
    /// Siren loop, vibration and a high-priority notification.
    Sounding,
    /// Sounding alarm the caregiver silenced; stays quiet until Normal.
    Silenced,
}

/// What a caregiver currently knows about one household.
#[derive(Clone, Debug, PartialEq)]
pub struct HouseholdView {
    pub code: String,
    pub snapshot: Option<StatusSnapshot>,
    pub last_tag: EmergencyTag,
    pub alarm: AlarmLevel,
    pub applied: u64,
    pub stale_dropped: u64,
}

impl HouseholdView {
    fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            snapshot: None,
            last_tag: EmergencyTag::Normal,
            alarm: AlarmLevel::None,
            applied: 0,
            stale_dropped: 0,
        }
    }

    fn last_key(&self) -> Option<(i64, u64)> {
        self.snapshot.as_ref().map(StatusSnapshot::ordering_key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Raised(AlarmLevel),
    Cleared,
    Applied,
    Stale,
    Ignored,
}

pub struct CaregiverMonitor {
    views: HashMap<String, HouseholdView>,
    memberships: Memberships,
    sink: Arc<dyn AlertSink>,
}

impl CaregiverMonitor {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            views: HashMap::new(),
            memberships: Memberships::new(Role::Caregiver),
            sink,
        }
    }

    pub fn track(&mut self, code: &str) -> SResult<()> {
        self.memberships.add(code)?;
        self.views
            .entry(code.to_string())
            .or_insert_with(|| HouseholdView::new(code));
        Ok(())
    }

    /// Stops tracking `code`; a sounding alarm for it is stopped.
    pub fn untrack(&mut self, code: &str) {
        self.memberships.remove(code);
        if let Some(view) = self.views.remove(code) {
            if view.alarm == AlarmLevel::Sounding {
                self.stop_if_quiet();
            }
        }
    }

    pub fn set_active(&mut self, code: &str) -> SResult<()> {
        self.memberships.set_active(code)
    }

    pub fn active(&self) -> Option<&str> {
        self.memberships.active()
    }

    pub fn codes(&self) -> &[String] {
        self.memberships.codes()
    }

    pub fn view(&self, code: &str) -> Option<&HouseholdView> {
        self.views.get(code)
    }

    fn any_sounding(&self) -> bool {
        self.views.values().any(|v| v.alarm == AlarmLevel::Sounding)
    }

    fn stop_if_quiet(&self) {
        // The siren is shared by all households on the device.
        if !self.any_sounding() {
            self.sink.stop_siren();
            self.sink.vibrate(&[]);
        }
    }

    /// Applies one delivery for `code`. Older or duplicate snapshots (by
    /// `(last_update, sequence)`) are dropped.
    pub fn apply(&mut self, code: &str, snapshot: StatusSnapshot) -> UpdateOutcome {
        let is_active = self.memberships.active() == Some(code);
        let Some(view) = self.views.get_mut(code) else {
            debug!("[CAREGIVER] delivery for untracked {} ignored", code);
            return UpdateOutcome::Ignored;
        };
        if let Some(last) = view.last_key() {
            if snapshot.ordering_key() <= last {
                view.stale_dropped += 1;
                debug!(
                    "[CAREGIVER] {} dropped stale status seq {} (have {:?})",
                    code, snapshot.sequence, last
                );
                return UpdateOutcome::Stale;
            }
        }

        let previous = view.last_tag;
        let current = snapshot.status;
        view.last_tag = current;
        view.applied += 1;
        let name = if snapshot.name.is_empty() {
            "Your senior".to_string()
        } else {
            snapshot.name.clone()
        };
        let summary = snapshot.summary();
        view.snapshot = Some(snapshot);

        match (previous.is_emergency(), current.is_emergency()) {
            (false, true) => {
                let body = format!("{}: {}\n{}", name, current.label(), summary);
                if is_active {
                    view.alarm = AlarmLevel::Sounding;
                    warn!("[CAREGIVER] {} {} - raising alarm", code, current.label());
                    self.sink.vibrate(&CAREGIVER_ALARM_PATTERN);
                    self.sink.play_siren(true);
                    self.sink.show_notification(
                        Notification::new("🚨 EMERGENCY ALERT", &body, Priority::High)
                            .with_actions(&["Call", "Silence"]),
                    );
                } else {
                    view.alarm = AlarmLevel::Notified;
                    warn!("[CAREGIVER] {} {} (not active household)", code, current.label());
                    self.sink.show_notification(Notification::new(
                        &format!("Emergency in household {}", code),
                        &body,
                        Priority::Default,
                    ));
                }
                UpdateOutcome::Raised(view.alarm)
            }
            (true, false) => {
                let was_sounding = view.alarm == AlarmLevel::Sounding;
                view.alarm = AlarmLevel::None;
                info!("[CAREGIVER] {} back to Normal", code);
                if was_sounding {
                    self.stop_if_quiet();
                }
                UpdateOutcome::Cleared
            }
            _ => UpdateOutcome::Applied,
        }
    }

    /// Status removed from the store. The view keeps its last snapshot.
    pub fn apply_removed(&mut self, code: &str) -> UpdateOutcome {
        if self.views.contains_key(code) {
            debug!("[CAREGIVER] {} status removed", code);
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Ignored
        }
    }

    /// Explicit silence. The household stays in emergency until it reports Normal.
    pub fn silence(&mut self, code: &str) -> SResult<()> {
        let view = self
            .views
            .get_mut(code)
            .ok_or_else(|| SafeNestError::NotFound(format!("subscription {}", code)))?;
        if view.alarm == AlarmLevel::Sounding {
            view.alarm = AlarmLevel::Silenced;
            info!("[CAREGIVER] {} alarm silenced", code);
            self.stop_if_quiet();
        }
        Ok(())
    }
}

pub enum CaregiverCommand {
    Subscribe {
        code: String,
        reply: oneshot::Sender<SResult<()>>,
    },
    Unsubscribe {
        code: String,
        reply: oneshot::Sender<SResult<()>>,
    },
    SetActive {
        code: String,
        reply: oneshot::Sender<SResult<()>>,
    },
    Silence {
        code: String,
        reply: oneshot::Sender<SResult<()>>,
    },
    View {
        code: String,
        reply: oneshot::Sender<Option<HouseholdView>>,
    },
    Shutdown(oneshot::Sender<()>),
}

struct Delivery {
    code: String,
    subscription_id: u64,
    value: Option<Value>,
}

struct Forwarder {
    subscription_id: u64,
    task: JoinHandle<()>,
}

/// Handle onto a running caregiver session.
#[derive(Clone)]
pub struct CaregiverHandle {
    tx: mpsc::Sender<CaregiverCommand>,
}

impl CaregiverHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CaregiverCommand,
    ) -> SResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SafeNestError::SessionClosed)?;
        rx.await.map_err(|_| SafeNestError::SessionClosed)
    }

    pub async fn subscribe(&self, code: &str) -> SResult<()> {
        let code = code.to_string();
        self.request(|reply| CaregiverCommand::Subscribe { code, reply })
            .await?
    }

    pub async fn unsubscribe(&self, code: &str) -> SResult<()> {
        let code = code.to_string();
        self.request(|reply| CaregiverCommand::Unsubscribe { code, reply })
            .await?
    }

    pub async fn set_active(&self, code: &str) -> SResult<()> {
        let code = code.to_string();
        self.request(|reply| CaregiverCommand::SetActive { code, reply })
            .await?
    }

    pub async fn silence(&self, code: &str) -> SResult<()> {
        let code = code.to_string();
        self.request(|reply| CaregiverCommand::Silence { code, reply })
            .await?
    }

    pub async fn view(&self, code: &str) -> SResult<Option<HouseholdView>> {
        let code = code.to_string();
        self.request(|reply| CaregiverCommand::View { code, reply })
            .await
    }

    pub async fn shutdown(&self) -> SResult<()> {
        self.request(CaregiverCommand::Shutdown).await
    }
}

pub struct CaregiverSession<S: SharedStore> {
    identity: Identity,
    directory: HouseholdDirectory<S>,
    store: Arc<S>,
    monitor: CaregiverMonitor,
    forwarders: HashMap<String, Forwarder>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
}

impl<S: SharedStore> CaregiverSession<S> {
    /// Spawns the actor. Must be called inside a tokio runtime.
    pub fn start(store: Arc<S>, identity: Identity, sink: Arc<dyn AlertSink>) -> CaregiverHandle {
        let (tx, rx) = mpsc::channel(32);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let session = CaregiverSession {
            identity,
            directory: HouseholdDirectory::new(store.clone()),
            store,
            monitor: CaregiverMonitor::new(sink),
            forwarders: HashMap::new(),
            delivery_tx,
        };
        tokio::spawn(session.run(rx, delivery_rx));
        CaregiverHandle { tx }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<CaregiverCommand>,
        mut delivery_rx: mpsc::UnboundedReceiver<Delivery>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(CaregiverCommand::Shutdown(reply)) => {
                        self.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        self.close();
                        break;
                    }
                },
                Some(delivery) = delivery_rx.recv() => self.on_delivery(delivery),
            }
        }
    }

    fn handle(&mut self, cmd: CaregiverCommand) {
        match cmd {
            CaregiverCommand::Subscribe { code, reply } => {
                let _ = reply.send(self.subscribe(&code));
            }
            CaregiverCommand::Unsubscribe { code, reply } => {
                let _ = reply.send(self.unsubscribe(&code));
            }
            CaregiverCommand::SetActive { code, reply } => {
                let result = normalize_code(&code).and_then(|c| self.monitor.set_active(&c));
                let _ = reply.send(result);
            }
            CaregiverCommand::Silence { code, reply } => {
                let result = normalize_code(&code).and_then(|c| self.monitor.silence(&c));
                let _ = reply.send(result);
            }
            CaregiverCommand::View { code, reply } => {
                let view = normalize_code(&code)
                    .ok()
                    .and_then(|c| self.monitor.view(&c).cloned());
                let _ = reply.send(view);
            }
            CaregiverCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Only households this caregiver is a member of may be watched.
    fn subscribe(&mut self, code: &str) -> SResult<()> {
        let code = normalize_code(code)?;
        if self.forwarders.contains_key(&code) {
            return Ok(());
        }
        if !self.directory.validate(&code) {
            return Err(SafeNestError::NotFound(format!("household {}", code)));
        }
        let is_member = self
            .directory
            .members(&code)?
            .iter()
            .any(|m| m.role == Role::Caregiver && m.id == self.identity.id);
        if !is_member {
            return Err(SafeNestError::NotFound(format!(
                "{} is not a caregiver of {}",
                self.identity.name, code
            )));
        }

        let mut subscription = self.store.subscribe(&store::status_path(&code))?;
        let subscription_id = subscription.id;
        if let Err(e) = self.monitor.track(&code) {
            self.store.unsubscribe(subscription_id);
            return Err(e);
        }
        let tx = self.delivery_tx.clone();
        let task_code = code.clone();
        let task = tokio::spawn(async move {
            while let Some(value) = subscription.recv().await {
                let delivery = Delivery {
                    code: task_code.clone(),
                    subscription_id,
                    value,
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
        });
        self.forwarders.insert(
            code.clone(),
            Forwarder {
                subscription_id,
                task,
            },
        );
        info!("[CAREGIVER] {} watching {}", self.identity.name, code);
        Ok(())
    }

    fn unsubscribe(&mut self, code: &str) -> SResult<()> {
        let code = normalize_code(code)?;
        let Some(forwarder) = self.forwarders.remove(&code) else {
            return Err(SafeNestError::NotFound(format!("subscription {}", code)));
        };
        forwarder.task.abort();
        self.store.unsubscribe(forwarder.subscription_id);
        self.monitor.untrack(&code);
        info!("[CAREGIVER] {} stopped watching {}", self.identity.name, code);
        Ok(())
    }

    fn on_delivery(&mut self, delivery: Delivery) {
        // Deliveries queued by a forwarder that has since been replaced or removed.
        let current = self
            .forwarders
            .get(&delivery.code)
            .map(|f| f.subscription_id);
        if current != Some(delivery.subscription_id) {
            return;
        }
        let outcome = match delivery.value {
            Some(value) => match serde_json::from_value::<StatusSnapshot>(value) {
                Ok(snapshot) => self.monitor.apply(&delivery.code, snapshot),
                Err(e) => {
                    warn!("[CAREGIVER] unreadable status for {}: {}", delivery.code, e);
                    UpdateOutcome::Ignored
                }
            },
            None => self.monitor.apply_removed(&delivery.code),
        };
        debug!("[CAREGIVER] {} delivery -> {:?}", delivery.code, outcome);
    }

    fn close(&mut self) {
        let codes: Vec<String> = self.forwarders.keys().cloned().collect();
        for code in codes {
            let _ = self.unsubscribe(&code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::household::LinkMode;
    use crate::store::MemoryStore;
    use crate::sync::StatusPublisher;
    use tokio::time::{sleep, Duration};

    fn snapshot(tag: EmergencyTag, ms: i64, seq: u64) -> StatusSnapshot {
        let mut s = StatusSnapshot::new("u1", "Alice");
        s.status = tag;
        s.last_update = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms).unwrap();
        s.sequence = seq;
        s
    }

    fn monitor(codes: &[&str]) -> (Arc<RecordingAlertSink>, CaregiverMonitor) {
        let sink = Arc::new(RecordingAlertSink::new());
        let mut monitor = CaregiverMonitor::new(sink.clone());
        for code in codes {
            monitor.track(code).unwrap();
        }
        (sink, monitor)
    }

    #[test]
    fn test_raise_once_clear_once() {
        let (sink, mut m) = monitor(&["HOME123"]);
        assert_eq!(
            m.apply("HOME123", snapshot(EmergencyTag::Normal, 1_000, 1)),
            UpdateOutcome::Applied
        );
        assert_eq!(
            m.apply("HOME123", snapshot(EmergencyTag::FallDetected, 2_000, 2)),
            UpdateOutcome::Raised(AlarmLevel::Sounding)
        );
        // Vitals refreshes while Active.
        for seq in 3..8 {
            assert_eq!(
                m.apply("HOME123", snapshot(EmergencyTag::FallDetected, 2_000 + seq as i64, seq)),
                UpdateOutcome::Applied
            );
        }
        assert_eq!(
            m.apply("HOME123", snapshot(EmergencyTag::Normal, 9_000, 9)),
            UpdateOutcome::Cleared
        );

        assert_eq!(sink.siren_starts(), 1);
        assert_eq!(sink.siren_stops(), 1);
        let alerts = sink.notifications();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].priority, Priority::High);
        assert!(alerts[0].body.contains("Alice: Fall Detected"));
        assert!(alerts[0].body.contains("Heart Rate"));
    }

    #[test]
    fn test_stale_and_duplicate_deliveries_dropped() {
        let (sink, mut m) = monitor(&["HOME123"]);
        m.apply("HOME123", snapshot(EmergencyTag::SosActive, 5_000, 4));
        // An older Normal arriving late must not clear the alarm.
        assert_eq!(
            m.apply("HOME123", snapshot(EmergencyTag::Normal, 4_000, 3)),
            UpdateOutcome::Stale
        );
        assert_eq!(
            m.apply("HOME123", snapshot(EmergencyTag::SosActive, 5_000, 4)),
            UpdateOutcome::Stale
        );
        assert_eq!(m.view("HOME123").unwrap().alarm, AlarmLevel::Sounding);
        assert_eq!(m.view("HOME123").unwrap().stale_dropped, 2);
        assert_eq!(sink.siren_stops(), 0);
    }

    #[test]
    fn test_inactive_household_only_notifies() {
        let (sink, mut m) = monitor(&["HOME123", "CABIN9"]);
        assert_eq!(m.active(), Some("HOME123"));
        assert_eq!(
            m.apply("CABIN9", snapshot(EmergencyTag::SosActive, 1_000, 1)),
            UpdateOutcome::Raised(AlarmLevel::Notified)
        );
        assert_eq!(sink.siren_starts(), 0);
        assert_eq!(sink.notifications()[0].priority, Priority::Default);

        m.apply("CABIN9", snapshot(EmergencyTag::Normal, 2_000, 2));
        assert_eq!(sink.siren_stops(), 0);
    }

    #[test]
    fn test_silence_stops_siren_until_normal() {
        let (sink, mut m) = monitor(&["HOME123"]);
        m.apply("HOME123", snapshot(EmergencyTag::FallDetected, 1_000, 1));
        m.silence("HOME123").unwrap();
        assert_eq!(sink.siren_stops(), 1);
        assert_eq!(m.view("HOME123").unwrap().alarm, AlarmLevel::Silenced);

        // Still Active: no new alarm.
        m.apply("HOME123", snapshot(EmergencyTag::FallDetected, 2_000, 2));
        assert_eq!(sink.siren_starts(), 1);

        m.apply("HOME123", snapshot(EmergencyTag::Normal, 3_000, 3));
        assert_eq!(sink.siren_stops(), 1);
        assert!(m.silence("NOPE").is_err());
    }

    #[test]
    fn test_untrack_stops_only_that_household() {
        let (sink, mut m) = monitor(&["HOME123", "CABIN9"]);
        m.apply("HOME123", snapshot(EmergencyTag::FallDetected, 1_000, 1));
        m.untrack("CABIN9");
        assert_eq!(sink.siren_stops(), 0);
        m.untrack("HOME123");
        assert_eq!(sink.siren_stops(), 1);
        assert_eq!(
            m.apply("HOME123", snapshot(EmergencyTag::Normal, 2_000, 2)),
            UpdateOutcome::Ignored
        );
    }

    fn linked_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let directory = HouseholdDirectory::new(store.clone());
        directory
            .link_as_monitored_person(
                "HOME123",
                &Identity::new("u1", "Alice", "5551234567"),
                LinkMode::Create,
            )
            .unwrap();
        directory
            .link_as_caregiver("HOME123", &Identity::new("c1", "Bob", "5559876543"))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_session_alerts_from_store_and_unsubscribe_stops() {
        let store = linked_store();
        let sink = Arc::new(RecordingAlertSink::new());
        let handle =
            CaregiverSession::start(store.clone(), Identity::new("c1", "Bob", ""), sink.clone());
        handle.subscribe("home123").await.unwrap();

        let mut publisher = StatusPublisher::new(store.clone(), "HOME123");
        let mut status = StatusSnapshot::new("u1", "Alice");
        status.status = EmergencyTag::SosActive;
        publisher.publish(&mut status);
        sleep(Duration::from_millis(20)).await;

        let view = handle.view("HOME123").await.unwrap().unwrap();
        assert_eq!(view.last_tag, EmergencyTag::SosActive);
        assert_eq!(sink.siren_starts(), 1);

        handle.unsubscribe("HOME123").await.unwrap();
        assert_eq!(sink.siren_stops(), 1);

        status.status = EmergencyTag::Normal;
        publisher.publish(&mut status);
        status.status = EmergencyTag::FallDetected;
        publisher.publish(&mut status);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.siren_starts(), 1);
        assert!(handle.view("HOME123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_requires_membership() {
        let store = linked_store();
        let sink = Arc::new(RecordingAlertSink::new());
        let stranger =
            CaregiverSession::start(store.clone(), Identity::new("c9", "Eve", ""), sink.clone());
        assert!(matches!(
            stranger.subscribe("HOME123").await,
            Err(SafeNestError::NotFound(_))
        ));
        assert!(matches!(
            stranger.subscribe("ZZZ999").await,
            Err(SafeNestError::NotFound(_))
        ));
        stranger.shutdown().await.unwrap();
        assert!(matches!(
            stranger.subscribe("HOME123").await,
            Err(SafeNestError::SessionClosed)
        ));
    }

    /// Store whose next `subscribe` fails as if the network dropped.
    struct FlakyStore {
        inner: MemoryStore,
        fail_next_subscribe: std::sync::atomic::AtomicBool,
    }

    impl SharedStore for FlakyStore {
        fn get(&self, path: &str) -> Result<Option<Value>, store::StoreError> {
            self.inner.get(path)
        }

        fn set(&self, path: &str, value: Value) -> Result<(), store::StoreError> {
            self.inner.set(path, value)
        }

        fn children(&self, path: &str) -> Result<Vec<String>, store::StoreError> {
            self.inner.children(path)
        }

        fn subscribe(&self, path: &str) -> Result<store::StoreSubscription, store::StoreError> {
            use std::sync::atomic::Ordering;
            if self.fail_next_subscribe.swap(false, Ordering::SeqCst) {
                return Err(store::StoreError::Offline);
            }
            self.inner.subscribe(path)
        }

        fn unsubscribe(&self, id: u64) {
            self.inner.unsubscribe(id)
        }
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_phantom_household() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_next_subscribe: std::sync::atomic::AtomicBool::new(true),
        });
        let directory = HouseholdDirectory::new(store.clone());
        let bob = Identity::new("c1", "Bob", "5559876543");
        for (code, senior) in [
            ("HOME123", Identity::new("u1", "Alice", "5551234567")),
            ("CABIN9", Identity::new("u2", "Dan", "5551112222")),
        ] {
            directory
                .link_as_monitored_person(code, &senior, LinkMode::Create)
                .unwrap();
            directory.link_as_caregiver(code, &bob).unwrap();
        }

        let sink = Arc::new(RecordingAlertSink::new());
        let handle = CaregiverSession::start(store.clone(), bob.clone(), sink.clone());
        assert!(matches!(
            handle.subscribe("HOME123").await,
            Err(SafeNestError::StoreUnavailable(_))
        ));
        assert!(handle.view("HOME123").await.unwrap().is_none());

        // The only live household must be the active one and sound the siren.
        handle.subscribe("CABIN9").await.unwrap();
        let mut publisher = StatusPublisher::new(store.clone(), "CABIN9");
        let mut status = StatusSnapshot::new("u2", "Dan");
        status.status = EmergencyTag::SosActive;
        publisher.publish(&mut status);
        sleep(Duration::from_millis(20)).await;

        let view = handle.view("CABIN9").await.unwrap().unwrap();
        assert_eq!(view.alarm, AlarmLevel::Sounding);
        assert_eq!(sink.siren_starts(), 1);

        // Retrying once the store is back works.
        handle.subscribe("HOME123").await.unwrap();
        assert!(handle.view("HOME123").await.unwrap().is_some());
        handle.unsubscribe("HOME123").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_caregivers_follow_monitored_session() {
        use crate::arbiter::{Signal, SignalKind};
        use crate::config::{DetectionConfig, SessionOptions};
        use crate::session::MonitoredSession;
        use crate::types::Vitals;

        let store = linked_store();
        let directory = HouseholdDirectory::new(store.clone());
        let carol = Identity::new("c2", "Carol", "5552223333");
        directory.link_as_caregiver("HOME123", &carol).unwrap();

        let bob_sink = Arc::new(RecordingAlertSink::new());
        let carol_sink = Arc::new(RecordingAlertSink::new());
        let bob = CaregiverSession::start(
            store.clone(),
            Identity::new("c1", "Bob", ""),
            bob_sink.clone(),
        );
        let carol = CaregiverSession::start(store.clone(), carol, carol_sink.clone());
        bob.subscribe("HOME123").await.unwrap();
        carol.subscribe("HOME123").await.unwrap();

        let session = MonitoredSession::start(
            &directory,
            "HOME123",
            &DetectionConfig::default(),
            SessionOptions {
                member_id: "u1".to_string(),
                member_name: "Alice".to_string(),
                ..SessionOptions::default()
            },
            Arc::new(RecordingAlertSink::new()),
            None,
        )
        .unwrap();

        assert!(session
            .report(Signal::new(SignalKind::ManualSos))
            .await
            .unwrap()
            .is_accepted());
        sleep(Duration::from_millis(100)).await;
        // Warnings stay local.
        assert_eq!(bob_sink.siren_starts(), 0);

        sleep(Duration::from_secs(6)).await;
        for level in [90u8, 80, 70] {
            session
                .update_vitals(Vitals {
                    battery_level: level,
                    ..Vitals::default()
                })
                .await
                .unwrap();
        }
        session.mark_safe().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        for (handle, sink) in [(&bob, &bob_sink), (&carol, &carol_sink)] {
            assert_eq!(sink.siren_starts(), 1);
            assert_eq!(sink.siren_stops(), 1);
            let view = handle.view("HOME123").await.unwrap().unwrap();
            assert_eq!(view.last_tag, EmergencyTag::Normal);
            assert_eq!(view.alarm, AlarmLevel::None);
        }
    }
}
