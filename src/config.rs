use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{SResult, SafeNestError};

/// Minimum re-trigger cooldown for the loud-sound source.
pub const MIN_LOUD_SOUND_COOLDOWN_MS: u64 = 5_000;

/// Detection tuning handed in by the host at construction time.
///
/// Field names follow the camelCase keys the settings screen stores, so a
/// settings blob can be loaded directly with [`DetectionConfig::from_json_str`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    pub fall_impact_threshold: f64,     // m/s^2
    pub fall_inactivity_window_ms: u64, // low-motion tracking after impact
    pub sos_countdown_sec: u64,
    pub fall_countdown_sec: u64,
    pub loud_sound_db_threshold: f64,
    pub loud_sound_sustain_ms: u64,
    pub volume_button_window_ms: u64,
    pub volume_button_count: usize,
    pub loud_sound_cooldown_ms: u64,
    pub fall_impact_cooldown_ms: u64,
    pub low_motion_threshold: f64,
    pub sound_sample_interval_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            fall_impact_threshold: 40.0,
            fall_inactivity_window_ms: 1_000,
            sos_countdown_sec: 5,
            fall_countdown_sec: 10,
            loud_sound_db_threshold: 50.0,
            loud_sound_sustain_ms: 300,
            volume_button_window_ms: 2_000,
            volume_button_count: 3,
            loud_sound_cooldown_ms: MIN_LOUD_SOUND_COOLDOWN_MS,
            fall_impact_cooldown_ms: 5_000,
            low_motion_threshold: 5.0,
            sound_sample_interval_ms: 100,
        }
    }
}

impl DetectionConfig {
    pub fn from_json_str(json: &str) -> SResult<Self> {
        let config: DetectionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SResult<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            SafeNestError::InvalidInput(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> SResult<()> {
        if self.fall_countdown_sec == 0 || self.sos_countdown_sec == 0 {
            return Err(SafeNestError::InvalidInput(
                "countdowns must be at least one second".to_string(),
            ));
        }
        if self.volume_button_count == 0 {
            return Err(SafeNestError::InvalidInput(
                "volumeButtonCount must be positive".to_string(),
            ));
        }
        if self.fall_impact_threshold <= 0.0 || self.low_motion_threshold <= 0.0 {
            return Err(SafeNestError::InvalidInput(
                "acceleration thresholds must be positive".to_string(),
            ));
        }
        if self.volume_button_window_ms == 0 || self.loud_sound_sustain_ms == 0 {
            return Err(SafeNestError::InvalidInput(
                "detection windows must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fall_countdown(&self) -> Duration {
        Duration::from_secs(self.fall_countdown_sec)
    }

    pub fn sos_countdown(&self) -> Duration {
        Duration::from_secs(self.sos_countdown_sec)
    }

    /// Cooldown is never shorter than [`MIN_LOUD_SOUND_COOLDOWN_MS`].
    pub fn loud_sound_cooldown(&self) -> Duration {
        Duration::from_millis(self.loud_sound_cooldown_ms.max(MIN_LOUD_SOUND_COOLDOWN_MS))
    }

    pub fn fall_impact_cooldown(&self) -> Duration {
        Duration::from_millis(self.fall_impact_cooldown_ms)
    }

    pub fn fall_inactivity_window(&self) -> Duration {
        Duration::from_millis(self.fall_inactivity_window_ms)
    }

    pub fn loud_sound_sustain(&self) -> Duration {
        Duration::from_millis(self.loud_sound_sustain_ms)
    }

    pub fn volume_button_window(&self) -> Duration {
        Duration::from_millis(self.volume_button_window_ms)
    }

    pub fn sound_sample_interval(&self) -> Duration {
        Duration::from_millis(self.sound_sample_interval_ms)
    }
}

/// Per-device session settings that are not detection tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionOptions {
    pub member_id: String,
    pub member_name: String,
    pub emergency_number: String,
    /// Dial `emergency_number` automatically on entering Active.
    pub auto_dial: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            member_id: String::new(),
            member_name: "Senior".to_string(),
            emergency_number: "102".to_string(),
            auto_dial: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            DetectionConfig::from_json_str(r#"{"fallCountdownSec": 15, "volumeButtonCount": 4}"#)
                .unwrap();
        assert_eq!(config.fall_countdown_sec, 15);
        assert_eq!(config.volume_button_count, 4);
        assert_eq!(config.sos_countdown_sec, 5);
        assert_eq!(config.fall_impact_threshold, 40.0);
    }

    #[test]
    fn test_zero_countdown_rejected() {
        let err = DetectionConfig::from_json_str(r#"{"sosCountdownSec": 0}"#).unwrap_err();
        assert!(matches!(err, SafeNestError::InvalidInput(_)));
    }

    #[test]
    fn test_loud_sound_cooldown_clamped() {
        let config = DetectionConfig {
            loud_sound_cooldown_ms: 1_000,
            ..DetectionConfig::default()
        };
        assert_eq!(config.loud_sound_cooldown(), Duration::from_secs(5));
    }
}
