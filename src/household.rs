//! Household membership: one monitored person per code, any number of caregivers.
//!
//! The store gives no transactions, so `link_as_monitored_person` re-reads the
//! member list right before writing. Two devices linking the same code at the
//! same instant can still both succeed; that window is accepted.

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{SResult, SafeNestError};
use crate::store::{self, SharedStore, HOUSEHOLDS_ROOT};
use crate::types::{HouseholdMeta, Identity, MemberRecord, Role};

pub const MIN_CODE_LEN: usize = 3;
pub const PHONE_DIGITS: usize = 10;

/// Strips everything but digits.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalized phone, or `InvalidInput` unless exactly ten digits remain.
pub fn validate_phone(raw: &str) -> SResult<String> {
    let normalized = normalize_phone(raw);
    if normalized.len() != PHONE_DIGITS {
        return Err(SafeNestError::InvalidInput(format!(
            "phone must have {} digits, got {}",
            PHONE_DIGITS,
            normalized.len()
        )));
    }
    Ok(normalized)
}

/// Codes are case-insensitive; the canonical form is trimmed upper case.
pub fn normalize_code(raw: &str) -> SResult<String> {
    let code = raw.trim().to_uppercase();
    if code.chars().count() < MIN_CODE_LEN {
        return Err(SafeNestError::InvalidInput(format!(
            "household code needs at least {} characters",
            MIN_CODE_LEN
        )));
    }
    if code.contains('/') {
        return Err(SafeNestError::InvalidInput(
            "household code cannot contain '/'".to_string(),
        ));
    }
    Ok(code)
}

/// How a monitored person is linking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    /// First-time setup on the monitored person's own device; may provision the household.
    Create,
    /// Re-joining an existing household; fails with `NotFound` if it does not exist.
    Join,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkOutcome {
    pub code: String,
    /// Key the member record was written under.
    pub member_id: String,
    pub created_household: bool,
    /// The same identity was already a member and was updated in place.
    pub relinked: bool,
}

fn same_identity(member: &MemberRecord, identity: &Identity) -> bool {
    let phone = normalize_phone(&identity.phone);
    let phone_match = !phone.is_empty() && normalize_phone(&member.phone) == phone;
    let id_match = !identity.id.is_empty() && member.id == identity.id;
    phone_match || id_match
}

fn check_identity(identity: &Identity) -> SResult<()> {
    if identity.id.trim().is_empty() {
        return Err(SafeNestError::InvalidInput("member id is required".to_string()));
    }
    if identity.id.contains('/') {
        return Err(SafeNestError::InvalidInput(
            "member id cannot contain '/'".to_string(),
        ));
    }
    if !identity.phone.trim().is_empty() {
        validate_phone(&identity.phone)?;
    }
    Ok(())
}

pub struct HouseholdDirectory<S: SharedStore> {
    store: Arc<S>,
}

impl<S: SharedStore> HouseholdDirectory<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<S> {
        self.store.clone()
    }

    /// True iff a household with this code exists. Read failures count as absent.
    pub fn validate(&self, code: &str) -> bool {
        let Ok(code) = normalize_code(code) else {
            return false;
        };
        match self.read_meta(&code) {
            Ok(meta) => meta.is_some(),
            Err(e) => {
                warn!("[DIRECTORY] validate {} failed: {}", code, e);
                false
            }
        }
    }

    fn read_meta(&self, code: &str) -> SResult<Option<HouseholdMeta>> {
        match self.store.get(&store::meta_path(code))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn meta(&self, code: &str) -> SResult<Option<HouseholdMeta>> {
        self.read_meta(&normalize_code(code)?)
    }

    fn write_meta(&self, code: &str, created_by: &str, role: Role) -> SResult<()> {
        let meta = HouseholdMeta {
            created_by: created_by.to_string(),
            role: role.tag().to_string(),
            updated_at: Utc::now(),
        };
        self.store
            .set(&store::meta_path(code), serde_json::to_value(&meta)?)?;
        Ok(())
    }

    fn read_members(&self, code: &str) -> SResult<Vec<MemberRecord>> {
        let Some(Value::Object(map)) = self.store.get(&store::members_path(code))? else {
            return Ok(Vec::new());
        };
        let mut members = Vec::with_capacity(map.len());
        for (key, value) in map {
            match serde_json::from_value::<MemberRecord>(value) {
                Ok(member) => members.push(member),
                Err(e) => warn!("[DIRECTORY] skipping malformed member {}/{}: {}", code, key, e),
            }
        }
        Ok(members)
    }

    pub fn members(&self, code: &str) -> SResult<Vec<MemberRecord>> {
        self.read_members(&normalize_code(code)?)
    }

    pub fn monitored_person(&self, code: &str) -> SResult<Option<MemberRecord>> {
        Ok(self
            .members(code)?
            .into_iter()
            .find(|m| m.role == Role::MonitoredPerson))
    }

    /// Existing member of `code` whose normalized phone matches.
    pub fn member_by_phone(&self, code: &str, phone: &str) -> SResult<Option<MemberRecord>> {
        let phone = validate_phone(phone)?;
        Ok(self
            .members(code)?
            .into_iter()
            .find(|m| normalize_phone(&m.phone) == phone))
    }

    fn write_member(&self, code: &str, member: &MemberRecord) -> SResult<()> {
        self.store.set(
            &store::member_path(code, &member.id),
            serde_json::to_value(member)?,
        )?;
        Ok(())
    }

    pub fn link_as_monitored_person(
        &self,
        code: &str,
        identity: &Identity,
        mode: LinkMode,
    ) -> SResult<LinkOutcome> {
        let code = normalize_code(code)?;
        check_identity(identity)?;

        let meta = self.read_meta(&code)?;
        if meta.is_none() && mode == LinkMode::Join {
            return Err(SafeNestError::NotFound(format!("household {}", code)));
        }

        // Re-read right before writing to narrow the two-device race.
        let members = self.read_members(&code)?;
        let existing = members.iter().find(|m| m.role == Role::MonitoredPerson);

        let (member_id, joined_at, relinked) = match existing {
            Some(occupant) if !same_identity(occupant, identity) => {
                info!(
                    "[DIRECTORY] {} already has monitored person {}, rejecting {}",
                    code, occupant.name, identity.name
                );
                return Err(SafeNestError::Conflict {
                    existing_name: occupant.name.clone(),
                });
            }
            Some(occupant) => (occupant.id.clone(), occupant.joined_at, true),
            None => {
                if let Some(other) = members.iter().find(|m| m.id == identity.id) {
                    return Err(SafeNestError::InvalidInput(format!(
                        "member id {} already used by {} ({})",
                        other.id,
                        other.name,
                        other.role.tag()
                    )));
                }
                (identity.id.clone(), Utc::now(), false)
            }
        };

        let created_household = meta.is_none();
        if created_household {
            let created_by = if identity.name.is_empty() {
                "Senior"
            } else {
                identity.name.as_str()
            };
            self.write_meta(&code, created_by, Role::MonitoredPerson)?;
            info!("[DIRECTORY] household {} provisioned by monitored person", code);
        }

        let member = MemberRecord {
            id: member_id.clone(),
            name: identity.name.clone(),
            role: Role::MonitoredPerson,
            phone: identity.phone.clone(),
            joined_at,
        };
        self.write_member(&code, &member)?;

        if let Ok(phone) = validate_phone(&identity.phone) {
            if let Err(e) = self.register_phone_index(&phone, &code) {
                warn!("[DIRECTORY] phone index write for {} failed: {}", code, e);
            }
        }

        debug!(
            "[DIRECTORY] monitored person {} linked to {} (relinked={})",
            member_id, code, relinked
        );
        Ok(LinkOutcome {
            code,
            member_id,
            created_household,
            relinked,
        })
    }

    /// Caregivers may provision a household that does not exist yet.
    pub fn link_as_caregiver(&self, code: &str, identity: &Identity) -> SResult<LinkOutcome> {
        let code = normalize_code(code)?;
        check_identity(identity)?;

        let created_household = self.read_meta(&code)?.is_none();
        if created_household {
            let created_by = if identity.name.is_empty() {
                "Caregiver"
            } else {
                identity.name.as_str()
            };
            self.write_meta(&code, created_by, Role::Caregiver)?;
            info!("[DIRECTORY] household {} provisioned by caregiver", code);
        }

        let members = self.read_members(&code)?;
        let existing = members
            .iter()
            .find(|m| m.role == Role::Caregiver && same_identity(m, identity));

        let (member_id, joined_at, relinked) = match existing {
            Some(member) => (member.id.clone(), member.joined_at, true),
            None => {
                if let Some(other) = members.iter().find(|m| m.id == identity.id) {
                    return Err(SafeNestError::InvalidInput(format!(
                        "member id {} already used by {} ({})",
                        other.id,
                        other.name,
                        other.role.tag()
                    )));
                }
                (identity.id.clone(), Utc::now(), false)
            }
        };

        let member = MemberRecord {
            id: member_id.clone(),
            name: identity.name.clone(),
            role: Role::Caregiver,
            phone: identity.phone.clone(),
            joined_at,
        };
        self.write_member(&code, &member)?;

        Ok(LinkOutcome {
            code,
            member_id,
            created_household,
            relinked,
        })
    }

    /// Index first, then a scan of every household's members.
    pub fn lookup_code_by_phone(&self, phone: &str) -> SResult<Option<String>> {
        let phone = validate_phone(phone)?;

        match self.store.get(&store::phone_index_path(&phone)) {
            Ok(Some(Value::String(code))) => return Ok(Some(code)),
            Ok(Some(other)) => warn!(
                "[DIRECTORY] ignoring malformed index entry {}: {}",
                phone, other
            ),
            Ok(None) => debug!("[DIRECTORY] {} not indexed, scanning households", phone),
            Err(e) => warn!("[DIRECTORY] phone index read failed, scanning: {}", e),
        }

        let Some((code, member)) = self.scan_for_phone(&phone) else {
            return Ok(None);
        };
        if member.role == Role::MonitoredPerson {
            if let Err(e) = self.register_phone_index(&phone, &code) {
                warn!("[DIRECTORY] could not rebuild index for {}: {}", phone, e);
            }
        }
        Ok(Some(code))
    }

    /// Rejects duplicate registrations system-wide. Read failures answer `false`.
    pub fn is_phone_registered(&self, phone: &str) -> SResult<bool> {
        let phone = validate_phone(phone)?;
        match self.store.get(&store::phone_index_path(&phone)) {
            Ok(Some(_)) => return Ok(true),
            Ok(None) => {}
            Err(e) => warn!("[DIRECTORY] phone index read failed, scanning: {}", e),
        }
        Ok(self.scan_for_phone(&phone).is_some())
    }

    fn scan_for_phone(&self, phone: &str) -> Option<(String, MemberRecord)> {
        let codes = match self.store.children(HOUSEHOLDS_ROOT) {
            Ok(codes) => codes,
            Err(e) => {
                warn!("[DIRECTORY] household scan failed: {}", e);
                return None;
            }
        };
        for code in codes {
            match self.read_members(&code) {
                Ok(members) => {
                    if let Some(member) = members
                        .into_iter()
                        .find(|m| normalize_phone(&m.phone) == phone)
                    {
                        return Some((code, member));
                    }
                }
                Err(e) => warn!("[DIRECTORY] scan of {} failed: {}", code, e),
            }
        }
        None
    }

    /// Idempotent upsert of `phoneIndex/{phone} = code`.
    pub fn register_phone_index(&self, phone: &str, code: &str) -> SResult<()> {
        let phone = validate_phone(phone)?;
        let code = normalize_code(code)?;
        self.store
            .set(&store::phone_index_path(&phone), Value::String(code))?;
        Ok(())
    }
}

/// The household codes a local profile belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Memberships {
    role: Role,
    codes: Vec<String>,
    active: Option<String>,
}

impl Memberships {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            codes: Vec::new(),
            active: None,
        }
    }

    /// A monitored person holds one code; caregivers collect many.
    pub fn add(&mut self, code: &str) -> SResult<()> {
        let code = normalize_code(code)?;
        if self.codes.contains(&code) {
            return Ok(());
        }
        if self.role == Role::MonitoredPerson {
            if let Some(existing) = self.codes.first() {
                return Err(SafeNestError::AlreadyLinked(existing.clone()));
            }
        }
        self.codes.push(code.clone());
        if self.active.is_none() {
            self.active = Some(code);
        }
        Ok(())
    }

    pub fn set_active(&mut self, code: &str) -> SResult<()> {
        let code = normalize_code(code)?;
        if !self.codes.contains(&code) {
            return Err(SafeNestError::NotFound(format!("membership {}", code)));
        }
        self.active = Some(code);
        Ok(())
    }

    pub fn remove(&mut self, code: &str) {
        let Ok(code) = normalize_code(code) else {
            return;
        };
        self.codes.retain(|c| c != &code);
        if self.active.as_deref() == Some(code.as_str()) {
            self.active = self.codes.first().cloned();
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn contains(&self, code: &str) -> bool {
        normalize_code(code)
            .map(|c| self.codes.contains(&c))
            .unwrap_or(false)
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn directory() -> (Arc<MemoryStore>, HouseholdDirectory<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let directory = HouseholdDirectory::new(store.clone());
        (store, directory)
    }

    fn alice() -> Identity {
        Identity::new("u-alice", "Alice", "(555) 123-4567")
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_phone("+1 (555) 123-4567"), "15551234567");
        assert!(validate_phone("+1 (555) 123-4567").is_err());
        assert_eq!(validate_phone("555.123.4567").unwrap(), "5551234567");
        assert_eq!(normalize_code("  home123 ").unwrap(), "HOME123");
        assert!(matches!(normalize_code("ab"), Err(SafeNestError::InvalidInput(_))));
    }

    #[test]
    fn test_first_link_provisions_household() {
        let (_, dir) = directory();
        assert!(!dir.validate("home123"));

        let outcome = dir
            .link_as_monitored_person("home123", &alice(), LinkMode::Create)
            .unwrap();
        assert!(outcome.created_household);
        assert!(!outcome.relinked);
        assert_eq!(outcome.code, "HOME123");

        assert!(dir.validate("Home123"));
        let meta = dir.meta("HOME123").unwrap().unwrap();
        assert_eq!(meta.role, "SENIOR");
        assert_eq!(meta.created_by, "Alice");
    }

    #[test]
    fn test_second_monitored_person_conflicts() {
        let (_, dir) = directory();
        dir.link_as_monitored_person("HOME123", &alice(), LinkMode::Create)
            .unwrap();

        let bob = Identity::new("u-bob", "Bob", "5559876543");
        let err = dir
            .link_as_monitored_person("HOME123", &bob, LinkMode::Join)
            .unwrap_err();
        assert_eq!(
            err,
            SafeNestError::Conflict {
                existing_name: "Alice".to_string()
            }
        );

        let occupant = dir.monitored_person("HOME123").unwrap().unwrap();
        assert_eq!(occupant.name, "Alice");
        assert_eq!(dir.members("HOME123").unwrap().len(), 1);
    }

    #[test]
    fn test_relink_same_phone_is_idempotent() {
        let (_, dir) = directory();
        let first = dir
            .link_as_monitored_person("HOME123", &alice(), LinkMode::Create)
            .unwrap();

        // Reinstall: new local id, same phone.
        let reinstalled = Identity::new("u-alice-2", "Alice", "5551234567");
        let second = dir
            .link_as_monitored_person("HOME123", &reinstalled, LinkMode::Join)
            .unwrap();
        assert!(second.relinked);
        assert!(!second.created_household);
        assert_eq!(second.member_id, first.member_id);

        let third = dir
            .link_as_monitored_person("HOME123", &reinstalled, LinkMode::Join)
            .unwrap();
        assert_eq!(third.member_id, first.member_id);
        assert_eq!(dir.members("HOME123").unwrap().len(), 1);
    }

    #[test]
    fn test_relink_by_id_without_phone() {
        let (_, dir) = directory();
        let no_phone = Identity::new("u-carl", "Carl", "");
        dir.link_as_monitored_person("CARL1", &no_phone, LinkMode::Create)
            .unwrap();
        let again = dir
            .link_as_monitored_person("CARL1", &no_phone, LinkMode::Join)
            .unwrap();
        assert!(again.relinked);
    }

    #[test]
    fn test_join_missing_household_not_found() {
        let (store, dir) = directory();
        let err = dir
            .link_as_monitored_person("NOPE1", &alice(), LinkMode::Join)
            .unwrap_err();
        assert!(matches!(err, SafeNestError::NotFound(_)));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_caregiver_provisions_then_senior_joins() {
        let (_, dir) = directory();
        let carol = Identity::new("u-carol", "Carol", "5550001111");
        let outcome = dir.link_as_caregiver("family9", &carol).unwrap();
        assert!(outcome.created_household);
        assert_eq!(dir.meta("FAMILY9").unwrap().unwrap().role, "CAREGIVER");

        let joined = dir
            .link_as_monitored_person("FAMILY9", &alice(), LinkMode::Join)
            .unwrap();
        assert!(!joined.created_household);
        // Creator role stays as provisioned.
        assert_eq!(dir.meta("FAMILY9").unwrap().unwrap().role, "CAREGIVER");
        assert_eq!(dir.members("FAMILY9").unwrap().len(), 2);

        let again = dir.link_as_caregiver("FAMILY9", &carol).unwrap();
        assert!(again.relinked);
        assert_eq!(dir.members("FAMILY9").unwrap().len(), 2);
    }

    #[test]
    fn test_phone_index_roundtrip_and_scan_fallback() {
        let (store, dir) = directory();
        dir.link_as_monitored_person("HOME123", &alice(), LinkMode::Create)
            .unwrap();
        assert_eq!(
            dir.lookup_code_by_phone("5551234567").unwrap(),
            Some("HOME123".to_string())
        );

        store.remove(&store::phone_index_path("5551234567")).unwrap();
        assert_eq!(
            dir.lookup_code_by_phone("555-123-4567").unwrap(),
            Some("HOME123".to_string())
        );
        // Scan hit on a monitored person rebuilds the index.
        assert!(store
            .get(&store::phone_index_path("5551234567"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_register_phone_index_is_idempotent() {
        let (_, dir) = directory();
        dir.register_phone_index("5552223333", "abc").unwrap();
        dir.register_phone_index("5552223333", "ABC").unwrap();
        assert_eq!(
            dir.lookup_code_by_phone("5552223333").unwrap(),
            Some("ABC".to_string())
        );
    }

    #[test]
    fn test_scan_finds_caregivers() {
        let (_, dir) = directory();
        let carol = Identity::new("u-carol", "Carol", "5550001111");
        dir.link_as_caregiver("FAMILY9", &carol).unwrap();

        assert_eq!(
            dir.lookup_code_by_phone("5550001111").unwrap(),
            Some("FAMILY9".to_string())
        );
        assert!(dir.is_phone_registered("5550001111").unwrap());
        assert!(!dir.is_phone_registered("5559999999").unwrap());
        assert!(dir.is_phone_registered("123").is_err());
    }

    #[test]
    fn test_member_by_phone() {
        let (_, dir) = directory();
        dir.link_as_monitored_person("HOME123", &alice(), LinkMode::Create)
            .unwrap();
        let found = dir.member_by_phone("HOME123", "5551234567").unwrap();
        assert_eq!(found.map(|m| m.id), Some("u-alice".to_string()));
        assert!(dir.member_by_phone("HOME123", "5550000000").unwrap().is_none());
    }

    #[test]
    fn test_offline_link_reports_unavailable() {
        let (store, dir) = directory();
        store.set_offline(true);
        let err = dir
            .link_as_monitored_person("HOME123", &alice(), LinkMode::Create)
            .unwrap_err();
        assert!(matches!(err, SafeNestError::StoreUnavailable(_)));
        assert!(!dir.validate("HOME123"));
        assert!(!dir.is_phone_registered("5551234567").unwrap());
    }

    #[test]
    fn test_memberships_monitored_person_single_code() {
        let mut memberships = Memberships::new(Role::MonitoredPerson);
        memberships.add("home123").unwrap();
        memberships.add("HOME123").unwrap();
        assert_eq!(
            memberships.add("OTHER1"),
            Err(SafeNestError::AlreadyLinked("HOME123".to_string()))
        );
        assert_eq!(memberships.active(), Some("HOME123"));
    }

    #[test]
    fn test_memberships_caregiver_many_codes() {
        let mut memberships = Memberships::new(Role::Caregiver);
        memberships.add("AAA1").unwrap();
        memberships.add("BBB2").unwrap();
        assert_eq!(memberships.active(), Some("AAA1"));

        memberships.set_active("bbb2").unwrap();
        assert_eq!(memberships.active(), Some("BBB2"));
        assert!(memberships.set_active("CCC3").is_err());

        memberships.remove("BBB2");
        assert_eq!(memberships.active(), Some("AAA1"));
        assert_eq!(memberships.codes().len(), 1);
        assert!(memberships.contains("aaa1"));
    }
}
