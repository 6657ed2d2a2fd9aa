//! Authoritative emergency status for one monitored-person session.
//!
//! Every transition bumps `generation`. A countdown remembers the generation it
//! was started under, and [`EmergencyStateMachine::expire`] only acts when that
//! generation is still the live countdown, so a timer that fires after a cancel
//! (or after re-entering the same warning) is a no-op.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::DetectionConfig;
use crate::error::{SResult, SafeNestError};
use crate::types::EmergencyTag;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmergencyKind {
    Fall,
    Sos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyState {
    Idle,
    FallWarning,
    SosWarning,
    Active(EmergencyKind),
}

impl EmergencyState {
    pub fn warning(kind: EmergencyKind) -> Self {
        match kind {
            EmergencyKind::Fall => EmergencyState::FallWarning,
            EmergencyKind::Sos => EmergencyState::SosWarning,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, EmergencyState::Idle)
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, EmergencyState::FallWarning | EmergencyState::SosWarning)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EmergencyState::Active(_))
    }

    pub fn warning_kind(&self) -> Option<EmergencyKind> {
        match self {
            EmergencyState::FallWarning => Some(EmergencyKind::Fall),
            EmergencyState::SosWarning => Some(EmergencyKind::Sos),
            _ => None,
        }
    }

    /// Remote tag: warnings stay local, so only Active is non-Normal.
    pub fn tag(&self) -> EmergencyTag {
        match self {
            EmergencyState::Active(EmergencyKind::Fall) => EmergencyTag::FallDetected,
            EmergencyState::Active(EmergencyKind::Sos) => EmergencyTag::SosActive,
            _ => EmergencyTag::Normal,
        }
    }
}

impl fmt::Display for EmergencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyState::Idle => write!(f, "Idle"),
            EmergencyState::FallWarning => write!(f, "FallWarning"),
            EmergencyState::SosWarning => write!(f, "SOSWarning"),
            EmergencyState::Active(EmergencyKind::Fall) => write!(f, "Active(Fall)"),
            EmergencyState::Active(EmergencyKind::Sos) => write!(f, "Active(SOS)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Countdown {
    pub generation: u64,
    pub kind: EmergencyKind,
    pub duration: Duration,
    pub started_at: Instant,
}

impl Countdown {
    pub fn deadline(&self) -> Instant {
        self.started_at + self.duration
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionCause {
    SignalAccepted,
    Cancelled,
    Confirmed,
    Expired,
    MarkedSafe,
    Reset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: EmergencyState,
    pub to: EmergencyState,
    pub cause: TransitionCause,
    pub generation: u64,
}

pub struct EmergencyStateMachine {
    state: EmergencyState,
    generation: u64,
    countdown: Option<Countdown>,
    fall_countdown: Duration,
    sos_countdown: Duration,
}

impl EmergencyStateMachine {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            state: EmergencyState::Idle,
            generation: 0,
            countdown: None,
            fall_countdown: config.fall_countdown(),
            sos_countdown: config.sos_countdown(),
        }
    }

    pub fn state(&self) -> EmergencyState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn countdown(&self) -> Option<&Countdown> {
        self.countdown.as_ref()
    }

    pub fn countdown_for(&self, kind: EmergencyKind) -> Duration {
        match kind {
            EmergencyKind::Fall => self.fall_countdown,
            EmergencyKind::Sos => self.sos_countdown,
        }
    }

    fn transition(&mut self, to: EmergencyState, cause: TransitionCause) -> Transition {
        let from = self.state;
        self.generation += 1;
        self.state = to;
        if !to.is_warning() {
            self.countdown = None;
        }
        info!("[STATE] {} -> {} ({:?}, gen {})", from, to, cause, self.generation);
        Transition {
            from,
            to,
            cause,
            generation: self.generation,
        }
    }

    /// Idle -> Fall/SOS warning. The returned countdown carries a fresh generation.
    pub fn enter_warning(&mut self, kind: EmergencyKind, now: Instant) -> SResult<Countdown> {
        if !self.state.is_idle() {
            return Err(SafeNestError::InvalidTransition(format!(
                "cannot enter {} from {}",
                EmergencyState::warning(kind),
                self.state
            )));
        }
        let transition =
            self.transition(EmergencyState::warning(kind), TransitionCause::SignalAccepted);
        let countdown = Countdown {
            generation: transition.generation,
            kind,
            duration: self.countdown_for(kind),
            started_at: now,
        };
        self.countdown = Some(countdown.clone());
        Ok(countdown)
    }

    /// Warning -> Idle ("I'm OK").
    pub fn cancel(&mut self) -> SResult<Transition> {
        if !self.state.is_warning() {
            return Err(SafeNestError::InvalidTransition(format!(
                "nothing to cancel in {}",
                self.state
            )));
        }
        Ok(self.transition(EmergencyState::Idle, TransitionCause::Cancelled))
    }

    /// Warning -> Active, by explicit user action.
    pub fn confirm(&mut self) -> SResult<Transition> {
        let Some(kind) = self.state.warning_kind() else {
            return Err(SafeNestError::InvalidTransition(format!(
                "nothing to confirm in {}",
                self.state
            )));
        };
        Ok(self.transition(EmergencyState::Active(kind), TransitionCause::Confirmed))
    }

    /// Countdown expiry. Stale generations are ignored.
    pub fn expire(&mut self, generation: u64) -> Option<Transition> {
        let live = self.countdown.as_ref()?;
        if live.generation != generation {
            debug!(
                "[STATE] ignoring stale countdown gen {} (live gen {})",
                generation, live.generation
            );
            return None;
        }
        let kind = live.kind;
        Some(self.transition(EmergencyState::Active(kind), TransitionCause::Expired))
    }

    /// Active -> Idle.
    pub fn mark_safe(&mut self) -> SResult<Transition> {
        if !self.state.is_active() {
            return Err(SafeNestError::InvalidTransition(format!(
                "cannot mark safe from {}",
                self.state
            )));
        }
        Ok(self.transition(EmergencyState::Idle, TransitionCause::MarkedSafe))
    }

    /// Forced return to Idle (sign-out). `None` when already idle.
    pub fn reset(&mut self) -> Option<Transition> {
        if self.state.is_idle() {
            return None;
        }
        Some(self.transition(EmergencyState::Idle, TransitionCause::Reset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> EmergencyStateMachine {
        EmergencyStateMachine::new(&DetectionConfig::default())
    }

    #[test]
    fn test_fall_countdown_expires_to_active() {
        let mut sm = machine();
        let countdown = sm.enter_warning(EmergencyKind::Fall, Instant::now()).unwrap();
        assert_eq!(countdown.duration, Duration::from_secs(10));
        assert_eq!(sm.state(), EmergencyState::FallWarning);
        assert_eq!(sm.state().tag(), EmergencyTag::Normal);

        let t = sm.expire(countdown.generation).unwrap();
        assert_eq!(t.to, EmergencyState::Active(EmergencyKind::Fall));
        assert_eq!(sm.state().tag(), EmergencyTag::FallDetected);
        assert!(sm.countdown().is_none());
    }

    #[test]
    fn test_sos_countdown_is_five_seconds() {
        let mut sm = machine();
        let countdown = sm.enter_warning(EmergencyKind::Sos, Instant::now()).unwrap();
        assert_eq!(countdown.duration, Duration::from_secs(5));
        sm.confirm().unwrap();
        assert_eq!(sm.state().tag(), EmergencyTag::SosActive);
    }

    #[test]
    fn test_stale_generation_after_reentry_is_ignored() {
        let mut sm = machine();
        let first = sm.enter_warning(EmergencyKind::Fall, Instant::now()).unwrap();
        sm.cancel().unwrap();
        let second = sm.enter_warning(EmergencyKind::Fall, Instant::now()).unwrap();
        assert!(second.generation > first.generation);

        assert!(sm.expire(first.generation).is_none());
        assert_eq!(sm.state(), EmergencyState::FallWarning);
        assert!(sm.expire(second.generation).is_some());
    }

    #[test]
    fn test_expire_after_cancel_is_noop() {
        let mut sm = machine();
        let countdown = sm.enter_warning(EmergencyKind::Sos, Instant::now()).unwrap();
        sm.cancel().unwrap();
        assert!(sm.expire(countdown.generation).is_none());
        assert_eq!(sm.state(), EmergencyState::Idle);
    }

    #[test]
    fn test_no_direct_warning_to_warning() {
        let mut sm = machine();
        sm.enter_warning(EmergencyKind::Fall, Instant::now()).unwrap();
        let err = sm.enter_warning(EmergencyKind::Sos, Instant::now()).unwrap_err();
        assert!(matches!(err, SafeNestError::InvalidTransition(_)));
        assert_eq!(sm.state(), EmergencyState::FallWarning);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = machine();
        assert!(sm.cancel().is_err());
        assert!(sm.confirm().is_err());
        assert!(sm.mark_safe().is_err());
        assert!(sm.reset().is_none());

        sm.enter_warning(EmergencyKind::Sos, Instant::now()).unwrap();
        assert!(sm.mark_safe().is_err());
        sm.confirm().unwrap();
        assert!(sm.cancel().is_err());
        sm.mark_safe().unwrap();
        assert!(sm.state().is_idle());
    }

    #[test]
    fn test_reset_clears_countdown() {
        let mut sm = machine();
        let countdown = sm.enter_warning(EmergencyKind::Fall, Instant::now()).unwrap();
        let t = sm.reset().unwrap();
        assert_eq!(t.cause, TransitionCause::Reset);
        assert!(sm.expire(countdown.generation).is_none());
    }

    #[test]
    fn test_countdown_remaining() {
        let start = Instant::now();
        let countdown = Countdown {
            generation: 1,
            kind: EmergencyKind::Fall,
            duration: Duration::from_secs(10),
            started_at: start,
        };
        assert_eq!(countdown.remaining(start + Duration::from_secs(4)), Duration::from_secs(6));
        assert_eq!(countdown.remaining(start + Duration::from_secs(12)), Duration::ZERO);
    }
}
