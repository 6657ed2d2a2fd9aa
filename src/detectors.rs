use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::arbiter::{Signal, SignalKind};
use crate::config::DetectionConfig;

/// Minimum consecutive loud samples inside the sustain window.
pub const LOUD_SOUND_MIN_SAMPLES: usize = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccelSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelSample {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Accelerometer impact detector.
pub struct ImpactDetector {
    threshold: f64,          // m/s^2
    low_motion_threshold: f64, // deviation from 1 g
    inactivity_window: Duration,
    cooldown: Duration,
    last_impact: Option<Instant>,
    low_motion_samples: u32,
}

impl ImpactDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            threshold: config.fall_impact_threshold,
            low_motion_threshold: config.low_motion_threshold,
            inactivity_window: config.fall_inactivity_window(),
            cooldown: config.fall_impact_cooldown(),
            last_impact: None,
            low_motion_samples: 0,
        }
    }

    /// Emits FallImpact when the magnitude crosses the threshold, at most once
    /// per cooldown.
    pub fn detect(&mut self, sample: &AccelSample, now: Instant) -> Option<Signal> {
        let magnitude = sample.magnitude();

        if let Some(last) = self.last_impact {
            let since = now.saturating_duration_since(last);
            // Post-impact: count near-still samples as a hint the person stayed down.
            if since <= self.inactivity_window
                && (magnitude - 9.81).abs() < self.low_motion_threshold
            {
                self.low_motion_samples += 1;
            }
            if since < self.cooldown {
                return None;
            }
        }

        if magnitude > self.threshold {
            self.last_impact = Some(now);
            self.low_motion_samples = 0;
            debug!("[ARBITER] impact {:.1} m/s^2", magnitude);
            return Some(Signal::with_magnitude(SignalKind::FallImpact, magnitude));
        }
        None
    }

    /// Near-still samples seen inside the window after the last impact.
    pub fn low_motion_samples(&self) -> u32 {
        self.low_motion_samples
    }
}

/// Byte-spectrum RMS (0..=255) to approximate dB.
pub fn rms_to_db(rms: f64) -> f64 {
    if rms <= 0.0 {
        return 0.0;
    }
    20.0 * (rms / 255.0).log10() + 60.0
}

/// RMS of one byte-spectrum frame.
pub fn frame_rms(frame: &[u8]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&b| (b as f64) * (b as f64)).sum();
    (sum / frame.len() as f64).sqrt()
}

/// Sustained loud sound: a run of consecutive loud samples inside the sustain window.
pub struct LoudSoundDetector {
    db_threshold: f64,
    sustain: Duration,
    run: VecDeque<Instant>,
    peak_db: f64,
}

impl LoudSoundDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            db_threshold: config.loud_sound_db_threshold,
            sustain: config.loud_sound_sustain(),
            run: VecDeque::new(),
            peak_db: 0.0,
        }
    }

    pub fn sample(&mut self, db: f64, now: Instant) -> Option<Signal> {
        if db <= self.db_threshold {
            self.run.clear();
            self.peak_db = 0.0;
            return None;
        }

        self.run.push_back(now);
        self.peak_db = self.peak_db.max(db);
        while let Some(&first) = self.run.front() {
            if now.saturating_duration_since(first) > self.sustain {
                self.run.pop_front();
            } else {
                break;
            }
        }

        if self.run.len() >= LOUD_SOUND_MIN_SAMPLES {
            let peak = self.peak_db;
            self.run.clear();
            self.peak_db = 0.0;
            return Some(Signal::with_magnitude(SignalKind::SustainedLoudSound, peak));
        }
        None
    }

    pub fn sample_frame(&mut self, frame: &[u8], now: Instant) -> Option<Signal> {
        self.sample(rms_to_db(frame_rms(frame)), now)
    }
}

/// Rolling window of volume-button presses.
pub struct VolumeButtonDetector {
    window: Duration,
    required: usize,
    presses: VecDeque<Instant>,
}

impl VolumeButtonDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            window: config.volume_button_window(),
            required: config.volume_button_count,
            presses: VecDeque::new(),
        }
    }

    pub fn press(&mut self, now: Instant) -> Option<Signal> {
        self.presses
            .retain(|&t| now.saturating_duration_since(t) <= self.window);
        self.presses.push_back(now);

        if self.presses.len() >= self.required {
            let count = self.presses.len();
            self.presses.clear();
            return Some(Signal::with_magnitude(
                SignalKind::VolumeButtonPattern,
                count as f64,
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn test_impact_threshold_and_cooldown() {
        let config = DetectionConfig::default();
        let mut detector = ImpactDetector::new(&config);
        let t0 = Instant::now();

        assert!(detector.detect(&AccelSample::new(0.0, 0.0, 9.81), t0).is_none());
        let signal = detector.detect(&AccelSample::new(30.0, 30.0, 9.81), ms(t0, 20)).unwrap();
        assert_eq!(signal.kind, SignalKind::FallImpact);
        assert!(signal.magnitude.unwrap() > 40.0);

        // Second spike inside the cooldown is swallowed.
        assert!(detector.detect(&AccelSample::new(40.0, 30.0, 9.81), ms(t0, 500)).is_none());
        assert!(detector.detect(&AccelSample::new(40.0, 30.0, 9.81), ms(t0, 5_100)).is_some());
    }

    #[test]
    fn test_low_motion_after_impact() {
        let mut detector = ImpactDetector::new(&DetectionConfig::default());
        let t0 = Instant::now();
        detector.detect(&AccelSample::new(50.0, 0.0, 0.0), t0);
        for i in 1..=5 {
            detector.detect(&AccelSample::new(0.1, 0.1, 9.8), ms(t0, i * 100));
        }
        // Outside the 1 s window.
        detector.detect(&AccelSample::new(0.1, 0.1, 9.8), ms(t0, 1_500));
        assert_eq!(detector.low_motion_samples(), 5);
    }

    #[test]
    fn test_rms_to_db() {
        assert!((rms_to_db(255.0) - 60.0).abs() < 1e-9);
        assert!((rms_to_db(25.5) - 40.0).abs() < 1e-9);
        assert_eq!(rms_to_db(0.0), 0.0);
        assert_eq!(frame_rms(&[3, 4, 3, 4]), (12.5f64).sqrt());
    }

    #[test]
    fn test_loud_sound_needs_three_consecutive() {
        let mut detector = LoudSoundDetector::new(&DetectionConfig::default());
        let t0 = Instant::now();
        assert!(detector.sample(55.0, t0).is_none());
        assert!(detector.sample(56.0, ms(t0, 100)).is_none());
        // A quiet sample breaks the run.
        assert!(detector.sample(40.0, ms(t0, 200)).is_none());
        assert!(detector.sample(55.0, ms(t0, 300)).is_none());
        assert!(detector.sample(58.0, ms(t0, 400)).is_none());
        let signal = detector.sample(57.0, ms(t0, 500)).unwrap();
        assert_eq!(signal.kind, SignalKind::SustainedLoudSound);
        assert_eq!(signal.magnitude, Some(58.0));
        // Run restarts after emitting.
        assert!(detector.sample(57.0, ms(t0, 600)).is_none());
    }

    #[test]
    fn test_loud_sound_samples_too_far_apart() {
        let mut detector = LoudSoundDetector::new(&DetectionConfig::default());
        let t0 = Instant::now();
        assert!(detector.sample(60.0, t0).is_none());
        assert!(detector.sample(60.0, ms(t0, 250)).is_none());
        // The first sample has aged out of the 300 ms window.
        assert!(detector.sample(60.0, ms(t0, 500)).is_none());
    }

    #[test]
    fn test_volume_button_window() {
        let mut detector = VolumeButtonDetector::new(&DetectionConfig::default());
        let t0 = Instant::now();
        assert!(detector.press(t0).is_none());
        assert!(detector.press(ms(t0, 1_500)).is_none());
        // First press is older than 2 s by now.
        assert!(detector.press(ms(t0, 2_600)).is_none());
        let signal = detector.press(ms(t0, 3_000)).unwrap();
        assert_eq!(signal.kind, SignalKind::VolumeButtonPattern);
        assert_eq!(signal.magnitude, Some(3.0));
        assert!(detector.press(ms(t0, 3_100)).is_none());
    }
}
