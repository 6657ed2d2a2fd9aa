use std::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration, Instant};

use safenest_core::detectors::AccelSample;
use safenest_core::types::Location;

/// When the mock sources should inject events, relative to simulator start.
#[derive(Clone, Debug)]
pub struct SensorScript {
    pub start: Instant,
    pub fall_at: Option<Duration>,
    pub shout_at: Option<Duration>,
    pub buttons_at: Option<Duration>,
    pub mic_available: bool,
}

impl SensorScript {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// True while `elapsed` is inside `[at, at + len)`.
    fn within(&self, at: Option<Duration>, len: Duration) -> bool {
        match at {
            Some(at) => {
                let elapsed = self.elapsed();
                elapsed >= at && elapsed < at + len
            }
            None => false,
        }
    }
}

pub struct AccelReading {
    pub at: Instant,
    pub sample: AccelSample,
}

pub struct SoundFrame {
    pub at: Instant,
    pub frame: Vec<u8>,
}

pub async fn accel_loop(tx: Sender<AccelReading>, script: SensorScript) {
    let mut interval = interval(Duration::from_millis(20)); // ~50Hz sampling
    let mut sample_count = 0u64;
    let mut impact_sent = false;

    loop {
        interval.tick().await;

        let sample = if !impact_sent && script.within(script.fall_at, Duration::from_millis(200)) {
            impact_sent = true;
            eprintln!("[accel] injecting impact");
            AccelSample::new(30.0, 25.0, 20.0)
        } else {
            match read_accelerometer() {
                Some(data) => data,
                None => mock_accel_data(),
            }
        };

        match tx.try_send(AccelReading {
            at: Instant::now(),
            sample,
        }) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 500 == 0 {
                    eprintln!("[accel] {} samples", sample_count);
                }
            }
            Err(TrySendError::Closed(_)) => {
                eprintln!("[accel] Channel closed after {} samples", sample_count);
                break;
            }
            Err(TrySendError::Full(_)) => {
                // Channel full, drop this sample
            }
        }
    }
}

/// Byte-spectrum frames at the configured sample interval. A loud burst
/// lasts one second from `shout_at`.
pub async fn sound_loop(tx: Sender<SoundFrame>, script: SensorScript, every: Duration) {
    if !script.mic_available {
        eprintln!("[mic] permission denied, not sampling");
        return;
    }

    let mut interval = interval(every);
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let level = if script.within(script.shout_at, Duration::from_secs(1)) {
            200
        } else {
            10
        };
        let frame = mock_sound_frame(level);

        match tx.try_send(SoundFrame {
            at: Instant::now(),
            frame,
        }) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 100 == 0 {
                    eprintln!("[mic] {} frames", sample_count);
                }
            }
            Err(TrySendError::Closed(_)) => {
                eprintln!("[mic] Channel closed after {} frames", sample_count);
                break;
            }
            Err(TrySendError::Full(_)) => {}
        }
    }
}

/// Three volume-button presses 300 ms apart starting at `buttons_at`.
pub async fn button_loop(tx: Sender<Instant>, script: SensorScript) {
    let Some(at) = script.buttons_at else {
        return;
    };
    tokio::time::sleep_until(script.start + at).await;
    for press in 0..3 {
        if tx.send(Instant::now()).await.is_err() {
            return;
        }
        eprintln!("[button] press {}", press + 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

pub async fn gps_loop(tx: Sender<Location>) {
    let mut interval = interval(Duration::from_secs(5)); // 0.2 Hz
    let mut fix_count = 0u64;

    loop {
        interval.tick().await;

        match tx.try_send(mock_location(fix_count)) {
            Ok(_) => fix_count += 1,
            Err(TrySendError::Closed(_)) => {
                eprintln!("[gps] Channel closed after {} fixes", fix_count);
                break;
            }
            Err(TrySendError::Full(_)) => {}
        }
    }
}

fn read_accelerometer() -> Option<AccelSample> {
    // Format: Accelerometer event: x=X, y=Y, z=Z, accuracy=0, timestamp=TS
    match Command::new("termux-sensor")
        .arg("-n")
        .arg("1")
        .arg("-s")
        .arg("accelerometer")
        .output()
    {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout);
            parse_accel_output(&text)
        }
        Err(_) => None,
    }
}

fn parse_accel_output(output: &str) -> Option<AccelSample> {
    let mut axes = [None, None, None];

    for part in output.split(',') {
        let part = part.trim();
        let part = part.rsplit(' ').next().unwrap_or(part);
        for (i, prefix) in ["x=", "y=", "z="].iter().enumerate() {
            if let Some(val_str) = part.strip_prefix(prefix) {
                axes[i] = Some(val_str.trim().parse().ok()?);
            }
        }
    }

    Some(AccelSample::new(axes[0]?, axes[1]?, axes[2]?))
}

fn mock_accel_data() -> AccelSample {
    use std::f64::consts::PI;
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let t = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as f64 * 0.02;

    AccelSample::new(
        (t * 2.0 * PI).sin() * 0.5,
        (t * 2.0 * PI).cos() * 0.3,
        9.81 + (t * PI).sin() * 0.1,
    )
}

fn mock_sound_frame(level: u8) -> Vec<u8> {
    (0..64u8)
        .map(|i| level.saturating_add(i % 5))
        .collect()
}

fn mock_location(seq: u64) -> Location {
    let seq = seq as f64;
    Location {
        lat: 37.7749 + seq * 0.00001,
        lng: -122.4194 + seq * 0.00001,
        address: "Home".to_string(),
        updated_at: chrono::Utc::now(),
    }
}
