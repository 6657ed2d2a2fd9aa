use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Most recent activity entries kept on the status snapshot.
pub const ACTIVITY_LOG_CAPACITY: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// The monitored person; stored as "SENIOR".
    #[serde(rename = "SENIOR")]
    MonitoredPerson,
    Caregiver,
}

impl Role {
    pub fn tag(&self) -> &'static str {
        match self {
            Role::MonitoredPerson => "SENIOR",
            Role::Caregiver => "CAREGIVER",
        }
    }
}

/// Who is linking to a household. Phone may be empty when not provided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub phone: String,
}

impl Identity {
    pub fn new(id: &str, name: &str, phone: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub phone: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdMeta {
    pub created_by: String,
    /// Role tag of whoever provisioned the household ("SENIOR" | "CAREGIVER").
    pub role: String,
    pub updated_at: DateTime<Utc>,
}

/// Remote-visible emergency tag. Only Active maps to a non-Normal tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EmergencyTag {
    #[default]
    Normal,
    FallDetected,
    #[serde(rename = "SOSActive")]
    SosActive,
}

impl EmergencyTag {
    pub fn is_emergency(&self) -> bool {
        !matches!(self, EmergencyTag::Normal)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EmergencyTag::Normal => "Normal",
            EmergencyTag::FallDetected => "Fall Detected",
            EmergencyTag::SosActive => "SOS Active",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lng: 0.0,
            address: "Locating...".to_string(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vitals {
    pub heart_rate: u32,
    pub spo2: u32,
    pub battery_level: u8,
    pub steps: u32,
    pub body_temp: f64,
    pub is_moving: bool,
}

impl Default for Vitals {
    fn default() -> Self {
        Self {
            heart_rate: 72,
            spo2: 98,
            battery_level: 100,
            steps: 0,
            body_temp: 98.4,
            is_moving: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    Location,
    Battery,
    Emergency,
    Info,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

static ACTIVITY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Newest-first activity log, bounded to [`ACTIVITY_LOG_CAPACITY`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityLog {
    entries: VecDeque<ActivityItem>,
}

impl ActivityLog {
    pub fn push(&mut self, kind: ActivityKind, title: &str, details: Option<&str>) {
        let timestamp = Utc::now();
        let seq = ACTIVITY_SEQ.fetch_add(1, Ordering::Relaxed);
        self.entries.push_front(ActivityItem {
            id: format!("{}-{}", timestamp.timestamp_millis(), seq),
            kind,
            title: title.to_string(),
            timestamp,
            details: details.map(str::to_string),
        });
        self.entries.truncate(ACTIVITY_LOG_CAPACITY);
    }

    pub fn latest(&self) -> Option<&ActivityItem> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityItem> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The monitored person's live status as mirrored to `households/{code}/status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(rename = "userId")]
    pub monitored_person_id: String,
    #[serde(default)]
    pub name: String,
    pub status: EmergencyTag,
    pub location: Location,
    pub vitals: Vitals,
    pub last_update: DateTime<Utc>,
    /// Per-writer publish counter; breaks ties between equal `last_update`s.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub recent_activity: ActivityLog,
    #[serde(default = "default_true")]
    pub is_fall_detection_enabled: bool,
    #[serde(default = "default_true")]
    pub is_location_sharing_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl StatusSnapshot {
    pub fn new(monitored_person_id: &str, name: &str) -> Self {
        let mut recent_activity = ActivityLog::default();
        recent_activity.push(
            ActivityKind::Info,
            "System Active",
            Some("SafeNest monitoring started"),
        );
        Self {
            monitored_person_id: monitored_person_id.to_string(),
            name: name.to_string(),
            status: EmergencyTag::Normal,
            location: Location::default(),
            vitals: Vitals::default(),
            last_update: Utc::now(),
            sequence: 0,
            recent_activity,
            is_fall_detection_enabled: true,
            is_location_sharing_enabled: true,
        }
    }

    /// Ordering key used by readers to discard stale deliveries.
    pub fn ordering_key(&self) -> (i64, u64) {
        (self.last_update.timestamp_millis(), self.sequence)
    }

    /// One-paragraph summary used in caregiver notifications.
    pub fn summary(&self) -> String {
        format!(
            "Location: {}\nHeart Rate: {} bpm\nBattery: {}%",
            self.location.address, self.vitals.heart_rate, self.vitals.battery_level
        )
    }
}
