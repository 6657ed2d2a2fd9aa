//! Detection arbiter: decides whether a raw signal may move the state machine.
//!
//! Gate order is source-disabled, then the state gate, then the loud-sound
//! cooldown. The arbiter never touches the state machine itself; the session
//! applies an `Accepted` decision.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::DetectionConfig;
use crate::error::{SResult, SafeNestError};
use crate::state_machine::{EmergencyKind, EmergencyState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    FallImpact,
    SustainedLoudSound,
    #[serde(rename = "ManualSOS")]
    ManualSos,
    VolumeButtonPattern,
    LockScreenTap,
    WidgetTap,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::FallImpact,
        SignalKind::SustainedLoudSound,
        SignalKind::ManualSos,
        SignalKind::VolumeButtonPattern,
        SignalKind::LockScreenTap,
        SignalKind::WidgetTap,
    ];

    /// Which warning an accepted signal of this kind opens.
    pub fn warning(&self) -> EmergencyKind {
        match self {
            SignalKind::FallImpact | SignalKind::SustainedLoudSound => EmergencyKind::Fall,
            _ => EmergencyKind::Sos,
        }
    }

    /// Manual SOS is the floor: it can never be switched off.
    pub fn can_disable(&self) -> bool {
        !matches!(self, SignalKind::ManualSos)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SignalKind::FallImpact => "fall impact",
            SignalKind::SustainedLoudSound => "loud sound",
            SignalKind::ManualSos => "SOS button",
            SignalKind::VolumeButtonPattern => "volume buttons",
            SignalKind::LockScreenTap => "lock screen",
            SignalKind::WidgetTap => "widget",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A discrete event from a signal source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// m/s^2 for impacts, dB for loud sound, press count for buttons.
    pub magnitude: Option<f64>,
    pub details: Option<String>,
}

impl Signal {
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            magnitude: None,
            details: None,
        }
    }

    pub fn with_magnitude(kind: SignalKind, magnitude: f64) -> Self {
        Self {
            kind,
            magnitude: Some(magnitude),
            details: None,
        }
    }

    /// Text for the recent-activity entry written on acceptance.
    pub fn describe(&self) -> String {
        match (self.kind, self.magnitude) {
            (SignalKind::FallImpact, Some(m)) => format!("Impact of {:.1} m/s² detected", m),
            (SignalKind::SustainedLoudSound, Some(db)) => {
                format!("Sustained loud sound ({:.0} dB)", db)
            }
            (kind, _) => match &self.details {
                Some(details) => format!("Triggered via {} ({})", kind, details),
                None => format!("Triggered via {}", kind),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressReason {
    AlreadyActive,
    SourceDisabled,
    Cooldown,
}

impl SuppressReason {
    pub fn label(&self) -> &'static str {
        match self {
            SuppressReason::AlreadyActive => "already-active",
            SuppressReason::SourceDisabled => "source-disabled",
            SuppressReason::Cooldown => "cooldown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Accepted(EmergencyState),
    Suppressed(SuppressReason),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub accepted: u64,
    pub already_active: u64,
    pub source_disabled: u64,
    pub cooldown: u64,
}

pub struct DetectionArbiter {
    disabled: HashSet<SignalKind>,
    loud_sound_cooldown: Duration,
    last_loud_sound: Option<Instant>,
    stats: ArbiterStats,
}

impl DetectionArbiter {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            disabled: HashSet::new(),
            loud_sound_cooldown: config.loud_sound_cooldown(),
            last_loud_sound: None,
            stats: ArbiterStats::default(),
        }
    }

    pub fn report(&mut self, signal: &Signal, state: EmergencyState, now: Instant) -> Decision {
        let kind = signal.kind;
        let decision = if self.disabled.contains(&kind) {
            self.stats.source_disabled += 1;
            Decision::Suppressed(SuppressReason::SourceDisabled)
        } else if !state.is_idle() {
            self.stats.already_active += 1;
            Decision::Suppressed(SuppressReason::AlreadyActive)
        } else if kind == SignalKind::SustainedLoudSound && self.in_loud_sound_cooldown(now) {
            self.stats.cooldown += 1;
            Decision::Suppressed(SuppressReason::Cooldown)
        } else {
            if kind == SignalKind::SustainedLoudSound {
                self.last_loud_sound = Some(now);
            }
            self.stats.accepted += 1;
            Decision::Accepted(EmergencyState::warning(kind.warning()))
        };

        match decision {
            Decision::Accepted(into) => info!("[ARBITER] {} accepted -> {}", kind, into),
            Decision::Suppressed(reason) => {
                debug!("[ARBITER] {} suppressed ({}) in {}", kind, reason.label(), state)
            }
        }
        decision
    }

    fn in_loud_sound_cooldown(&self, now: Instant) -> bool {
        self.last_loud_sound
            .map(|last| now.saturating_duration_since(last) < self.loud_sound_cooldown)
            .unwrap_or(false)
    }

    pub fn toggle_source(&mut self, kind: SignalKind, enabled: bool) -> SResult<()> {
        if !enabled && !kind.can_disable() {
            return Err(SafeNestError::InvalidInput(
                "manual SOS cannot be disabled".to_string(),
            ));
        }
        let changed = if enabled {
            self.disabled.remove(&kind)
        } else {
            self.disabled.insert(kind)
        };
        if changed {
            info!(
                "[ARBITER] {} {}",
                kind,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Ok(())
    }

    pub fn is_enabled(&self, kind: SignalKind) -> bool {
        !self.disabled.contains(&kind)
    }

    pub fn enabled_sources(&self) -> Vec<SignalKind> {
        SignalKind::ALL
            .iter()
            .copied()
            .filter(|k| self.is_enabled(*k))
            .collect()
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> DetectionArbiter {
        DetectionArbiter::new(&DetectionConfig::default())
    }

    #[test]
    fn test_signal_kinds_map_to_warnings() {
        let now = Instant::now();
        for kind in SignalKind::ALL {
            let expected = match kind {
                SignalKind::FallImpact | SignalKind::SustainedLoudSound => {
                    EmergencyState::FallWarning
                }
                _ => EmergencyState::SosWarning,
            };
            let mut arb = arbiter();
            assert_eq!(
                arb.report(&Signal::new(kind), EmergencyState::Idle, now),
                Decision::Accepted(expected)
            );
        }
    }

    #[test]
    fn test_every_kind_suppressed_while_not_idle() {
        let mut arb = arbiter();
        let now = Instant::now();
        for state in [
            EmergencyState::FallWarning,
            EmergencyState::SosWarning,
            EmergencyState::Active(EmergencyKind::Fall),
        ] {
            for kind in SignalKind::ALL {
                assert_eq!(
                    arb.report(&Signal::new(kind), state, now),
                    Decision::Suppressed(SuppressReason::AlreadyActive)
                );
            }
        }
        assert_eq!(arb.stats().accepted, 0);
        assert_eq!(arb.stats().already_active, 18);
    }

    #[test]
    fn test_disabled_fall_source_wins_over_state_gate() {
        let mut arb = arbiter();
        arb.toggle_source(SignalKind::FallImpact, false).unwrap();
        let now = Instant::now();
        let signal = Signal::with_magnitude(SignalKind::FallImpact, 45.0);
        assert_eq!(
            arb.report(&signal, EmergencyState::Idle, now),
            Decision::Suppressed(SuppressReason::SourceDisabled)
        );
        assert_eq!(
            arb.report(&signal, EmergencyState::SosWarning, now),
            Decision::Suppressed(SuppressReason::SourceDisabled)
        );

        arb.toggle_source(SignalKind::FallImpact, true).unwrap();
        assert!(arb.report(&signal, EmergencyState::Idle, now).is_accepted());
    }

    #[test]
    fn test_manual_sos_cannot_be_disabled() {
        let mut arb = arbiter();
        assert!(arb.toggle_source(SignalKind::ManualSos, false).is_err());
        assert!(arb.is_enabled(SignalKind::ManualSos));
        assert!(arb.toggle_source(SignalKind::ManualSos, true).is_ok());
    }

    #[test]
    fn test_loud_sound_cooldown() {
        let mut arb = arbiter();
        let start = Instant::now();
        let signal = Signal::with_magnitude(SignalKind::SustainedLoudSound, 72.0);
        assert!(arb.report(&signal, EmergencyState::Idle, start).is_accepted());

        // Session cancelled quickly; the leaf restarted and fired again.
        assert_eq!(
            arb.report(&signal, EmergencyState::Idle, start + Duration::from_secs(2)),
            Decision::Suppressed(SuppressReason::Cooldown)
        );
        // Cooldown does not gate other kinds.
        assert!(arb
            .report(
                &Signal::new(SignalKind::FallImpact),
                EmergencyState::Idle,
                start + Duration::from_secs(2)
            )
            .is_accepted());
        assert!(arb
            .report(&signal, EmergencyState::Idle, start + Duration::from_secs(5))
            .is_accepted());
    }

    #[test]
    fn test_enabled_sources_lists_toggles() {
        let mut arb = arbiter();
        arb.toggle_source(SignalKind::SustainedLoudSound, false).unwrap();
        arb.toggle_source(SignalKind::VolumeButtonPattern, false).unwrap();
        let enabled = arb.enabled_sources();
        assert_eq!(enabled.len(), 4);
        assert!(enabled.contains(&SignalKind::ManualSos));
        assert!(!enabled.contains(&SignalKind::SustainedLoudSound));
    }

    #[test]
    fn test_signal_description() {
        let signal = Signal::with_magnitude(SignalKind::FallImpact, 42.34);
        assert_eq!(signal.describe(), "Impact of 42.3 m/s² detected");
        let mut tap = Signal::new(SignalKind::WidgetTap);
        assert_eq!(tap.describe(), "Triggered via widget");
        tap.details = Some("home screen".to_string());
        assert_eq!(tap.describe(), "Triggered via widget (home screen)");
    }
}
