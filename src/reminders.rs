//! Household reminders and emergency contacts, stored under the household.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{SResult, SafeNestError};
use crate::household::{normalize_code, validate_phone};
use crate::store::{self, SharedStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderKind {
    Medication,
    Hydration,
    Appointment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderStatus {
    Pending,
    Completed,
    Skipped,
    Snoozed,
}

impl ReminderStatus {
    pub fn tag(&self) -> &'static str {
        match self {
            ReminderStatus::Pending => "PENDING",
            ReminderStatus::Completed => "COMPLETED",
            ReminderStatus::Skipped => "SKIPPED",
            ReminderStatus::Snoozed => "SNOOZED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub instructions: String,
    /// 24h "HH:MM".
    pub time: String,
    #[serde(rename = "type")]
    pub kind: ReminderKind,
    pub status: ReminderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
}

/// Activity entry to append after a reminder was acted on.
#[derive(Clone, Debug, PartialEq)]
pub struct AdherenceNote {
    pub title: String,
    pub details: String,
}

pub fn validate_time(time: &str) -> SResult<()> {
    let bad = || SafeNestError::InvalidInput(format!("reminder time {:?} is not HH:MM", time));
    let (h, m) = time.split_once(':').ok_or_else(bad)?;
    if h.len() != 2 || m.len() != 2 {
        return Err(bad());
    }
    let h: u32 = h.parse().map_err(|_| bad())?;
    let m: u32 = m.parse().map_err(|_| bad())?;
    if h > 23 || m > 59 {
        return Err(bad());
    }
    Ok(())
}

pub struct ReminderBook<S: SharedStore> {
    store: Arc<S>,
    code: String,
}

impl<S: SharedStore> ReminderBook<S> {
    pub fn new(store: Arc<S>, code: &str) -> SResult<Self> {
        Ok(Self {
            store,
            code: normalize_code(code)?,
        })
    }

    pub fn add_reminder(&self, mut reminder: Reminder, created_by: &str) -> SResult<Reminder> {
        if reminder.id.is_empty() || reminder.id.contains('/') {
            return Err(SafeNestError::InvalidInput("reminder id is invalid".to_string()));
        }
        validate_time(&reminder.time)?;
        reminder.created_by = Some(created_by.to_string());
        self.store.set(
            &store::reminder_path(&self.code, &reminder.id),
            serde_json::to_value(&reminder)?,
        )?;
        debug!("[DIRECTORY] reminder {} added to {}", reminder.id, self.code);
        Ok(reminder)
    }

    /// Writes only the status field. Completing or snoozing yields an
    /// adherence note for the activity log.
    pub fn update_status(
        &self,
        id: &str,
        status: ReminderStatus,
    ) -> SResult<Option<AdherenceNote>> {
        let path = store::reminder_path(&self.code, id);
        if self.store.get(&path)?.is_none() {
            return Err(SafeNestError::NotFound(format!("reminder {}", id)));
        }
        self.store.set(
            &format!("{}/status", path),
            Value::String(status.tag().to_string()),
        )?;
        Ok(match status {
            ReminderStatus::Completed | ReminderStatus::Snoozed => Some(AdherenceNote {
                title: "Medication Adherence".to_string(),
                details: format!("{}: Reminder {}", status.tag(), id),
            }),
            _ => None,
        })
    }

    pub fn list_reminders(&self) -> SResult<Vec<Reminder>> {
        self.read_all(&store::reminders_path(&self.code))
    }

    /// First pending reminder scheduled at `now` ("HH:MM").
    pub fn due_reminder(&self, now: &str) -> SResult<Option<Reminder>> {
        Ok(self
            .list_reminders()?
            .into_iter()
            .find(|r| r.time == now && r.status == ReminderStatus::Pending))
    }

    pub fn add_contact(&self, mut contact: Contact) -> SResult<Contact> {
        if contact.id.is_empty() || contact.id.contains('/') {
            return Err(SafeNestError::InvalidInput("contact id is invalid".to_string()));
        }
        contact.phone = validate_phone(&contact.phone)?;
        self.store.set(
            &store::contact_path(&self.code, &contact.id),
            serde_json::to_value(&contact)?,
        )?;
        Ok(contact)
    }

    pub fn list_contacts(&self) -> SResult<Vec<Contact>> {
        self.read_all(&store::contacts_path(&self.code))
    }

    /// The contact marked primary, else the first one.
    pub fn primary_contact(&self) -> SResult<Option<Contact>> {
        let contacts = self.list_contacts()?;
        let primary = contacts.iter().find(|c| c.is_primary).cloned();
        Ok(primary.or_else(|| contacts.into_iter().next()))
    }

    fn read_all<T: serde::de::DeserializeOwned>(&self, path: &str) -> SResult<Vec<T>> {
        let Some(Value::Object(map)) = self.store.get(path)? else {
            return Ok(Vec::new());
        };
        let mut items = Vec::with_capacity(map.len());
        for (key, value) in map {
            match serde_json::from_value(value) {
                Ok(item) => items.push(item),
                Err(e) => warn!("[DIRECTORY] skipping malformed entry {}/{}: {}", path, key, e),
            }
        }
        Ok(items)
    }
}
