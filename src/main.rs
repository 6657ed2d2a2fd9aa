use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

mod sensors;

use safenest_core::alert::LogAlertSink;
use safenest_core::arbiter::{Signal, SignalKind};
use safenest_core::caregiver::CaregiverSession;
use safenest_core::config::{DetectionConfig, SessionOptions};
use safenest_core::detectors::{ImpactDetector, LoudSoundDetector, VolumeButtonDetector};
use safenest_core::household::{HouseholdDirectory, LinkMode};
use safenest_core::live_status::{self, LiveStatus};
use safenest_core::mailbox::SosMailbox;
use safenest_core::reminders::{Contact, Reminder, ReminderBook, ReminderKind, ReminderStatus};
use safenest_core::session::MonitoredSession;
use safenest_core::source_health::{source_health_task, Permission, SourceHealthMonitor};
use safenest_core::store::MemoryStore;
use safenest_core::sync::LocalMirror;
use safenest_core::types::{ActivityKind, Identity, Vitals};
use sensors::{AccelReading, SensorScript, SoundFrame};

#[derive(Parser, Debug)]
#[command(name = "safenest")]
#[command(about = "SafeNest simulator: one senior device and one caregiver", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "60")]
    duration: u64,

    /// Household code to create and join
    #[arg(long, default_value = "HOME123")]
    household: String,

    /// Detection settings JSON (camelCase keys)
    #[arg(long)]
    config: Option<String>,

    /// Output directory
    #[arg(long, default_value = "safenest_sessions")]
    output_dir: String,

    /// Inject an impact after this many seconds
    #[arg(long)]
    fall_at: Option<u64>,

    /// Inject a sustained loud sound after this many seconds
    #[arg(long)]
    shout_at: Option<u64>,

    /// Press the volume button pattern after this many seconds
    #[arg(long)]
    sos_at: Option<u64>,

    /// Press "I am OK" this many seconds into a warning countdown
    #[arg(long)]
    cancel_after: Option<u64>,

    /// Queue a widget SOS before the session starts
    #[arg(long)]
    widget_before_start: bool,

    /// Simulate a denied microphone permission
    #[arg(long)]
    deny_mic: bool,

    /// Dial the emergency number when an alert goes active
    #[arg(long)]
    auto_dial: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("[{}] SafeNest simulator starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Household: {}", args.household);
    println!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)?;

    let config = match args.config.as_deref() {
        Some(path) => DetectionConfig::from_json_file(path)?,
        None => DetectionConfig::default(),
    };

    // Household setup: the senior creates it, a caregiver joins.
    let store = Arc::new(MemoryStore::new());
    let directory = HouseholdDirectory::new(store.clone());
    let senior = Identity::new("senior-1", "Grandma Rose", "555-123-4567");
    let caregiver = Identity::new("caregiver-1", "Sam", "555-987-6543");

    let linked = directory.link_as_monitored_person(&args.household, &senior, LinkMode::Create)?;
    directory.link_as_caregiver(&linked.code, &caregiver)?;
    println!(
        "[{}] Linked {} to household {} (created: {})",
        ts_now(),
        senior.name,
        linked.code,
        linked.created_household
    );
    if let Some(code) = directory.lookup_code_by_phone(&senior.phone)? {
        println!("[{}] Phone lookup resolves to {}", ts_now(), code);
    }

    let book = ReminderBook::new(store.clone(), &linked.code)?;
    book.add_contact(Contact {
        id: "c1".to_string(),
        name: caregiver.name.clone(),
        phone: caregiver.phone.clone(),
        relationship: Some("Grandson".to_string()),
        is_primary: true,
    })?;
    let reminder_time = Utc::now().format("%H:%M").to_string();
    book.add_reminder(
        Reminder {
            id: "r1".to_string(),
            title: "Blood pressure pill".to_string(),
            instructions: "Take with water".to_string(),
            time: reminder_time,
            kind: ReminderKind::Medication,
            status: ReminderStatus::Pending,
            created_by: None,
        },
        &caregiver.name,
    )?;

    // Platform SOS taps can land before the session exists.
    let mailbox = SosMailbox::new();
    if args.widget_before_start {
        let delivery = mailbox.deposit(SignalKind::WidgetTap)?;
        println!("[{}] Widget SOS queued: {:?}", ts_now(), delivery);
    }

    let caregiver_handle = CaregiverSession::start(
        store.clone(),
        caregiver.clone(),
        Arc::new(LogAlertSink::new("caregiver")),
    );
    caregiver_handle.subscribe(&linked.code).await?;

    let mirror = LocalMirror::default();
    let options = SessionOptions {
        member_id: linked.member_id.clone(),
        member_name: senior.name.clone(),
        auto_dial: args.auto_dial,
        ..SessionOptions::default()
    };
    let session = MonitoredSession::start(
        &directory,
        &linked.code,
        &config,
        options,
        Arc::new(LogAlertSink::new("senior")),
        Some(mirror.clone()),
    )?;
    if let Some(request) = mailbox.attach(session.clone())? {
        println!("[{}] Drained queued {} request", ts_now(), request.kind);
    }

    let health = Arc::new(SourceHealthMonitor::new());
    health.record_permission(SignalKind::FallImpact, Permission::Granted);
    let mic_permission = if args.deny_mic {
        Permission::Denied
    } else {
        Permission::Granted
    };
    health.record_permission(SignalKind::SustainedLoudSound, mic_permission);
    let _health_handle = tokio::spawn(source_health_task(health.clone(), session.clone()));

    // Sensor channels
    let (accel_tx, mut accel_rx) = mpsc::channel::<AccelReading>(500);
    let (sound_tx, mut sound_rx) = mpsc::channel::<SoundFrame>(100);
    let (button_tx, mut button_rx) = mpsc::channel::<Instant>(16);
    let (gps_tx, mut gps_rx) = mpsc::channel(8);

    let start = Instant::now();
    let script = SensorScript {
        start,
        fall_at: args.fall_at.map(Duration::from_secs),
        shout_at: args.shout_at.map(Duration::from_secs),
        buttons_at: args.sos_at.map(Duration::from_secs),
        mic_available: !args.deny_mic,
    };

    let _accel_handle = tokio::spawn(sensors::accel_loop(accel_tx, script.clone()));
    let _sound_handle = tokio::spawn(sensors::sound_loop(
        sound_tx,
        script.clone(),
        config.sound_sample_interval(),
    ));
    let _button_handle = tokio::spawn(sensors::button_loop(button_tx, script));
    let _gps_handle = tokio::spawn(sensors::gps_loop(gps_tx));

    let mut impact = ImpactDetector::new(&config);
    let mut loud = LoudSoundDetector::new(&config);
    let mut buttons = VolumeButtonDetector::new(&config);

    let mut accel_count = 0u64;
    let mut sound_count = 0u64;
    let mut press_count = 0u64;
    let mut warning_since: Option<Instant> = None;
    let mut reminder_done = false;
    let mut battery: u8 = 24;
    let mut last_status_update = Instant::now();
    let mut last_vitals = Instant::now();

    println!("[{}] Monitoring...", ts_now());

    loop {
        if args.duration > 0 && start.elapsed() >= Duration::from_secs(args.duration) {
            println!("[{}] Duration reached, stopping...", ts_now());
            break;
        }

        while let Ok(reading) = accel_rx.try_recv() {
            health.sample(SignalKind::FallImpact);
            accel_count += 1;
            if let Some(signal) = impact.detect(&reading.sample, reading.at) {
                report(&session, signal);
            }
        }

        while let Ok(sound) = sound_rx.try_recv() {
            health.sample(SignalKind::SustainedLoudSound);
            sound_count += 1;
            if let Some(signal) = loud.sample_frame(&sound.frame, sound.at) {
                report(&session, signal);
            }
        }

        while let Ok(at) = button_rx.try_recv() {
            health.sample(SignalKind::VolumeButtonPattern);
            press_count += 1;
            if let Some(signal) = buttons.press(at) {
                report(&session, signal);
            }
        }

        while let Ok(location) = gps_rx.try_recv() {
            session.update_location(location).await?;
        }

        let status = session.status();

        // Simulated "I am OK" press during the countdown.
        if status.state.is_warning() {
            let since = *warning_since.get_or_insert_with(Instant::now);
            if let Some(after) = args.cancel_after {
                if since.elapsed() >= Duration::from_secs(after) {
                    match session.cancel().await {
                        Ok(()) => println!("[{}] Senior pressed \"I am OK\"", ts_now()),
                        Err(e) => println!("[{}] Cancel failed: {}", ts_now(), e),
                    }
                    warning_since = None;
                }
            }
        } else {
            warning_since = None;
        }

        if !reminder_done {
            let now_hhmm = Utc::now().format("%H:%M").to_string();
            if let Some(due) = book.due_reminder(&now_hhmm)? {
                println!("[{}] Reminder due: {}", ts_now(), due.title);
                if let Some(note) = book.update_status(&due.id, ReminderStatus::Completed)? {
                    session
                        .record_activity(
                            ActivityKind::Info,
                            &note.title,
                            Some(note.details.as_str()),
                        )
                        .await?;
                }
                reminder_done = true;
            }
        }

        if last_vitals.elapsed() >= Duration::from_secs(10) {
            battery = battery.saturating_sub(2);
            session
                .update_vitals(Vitals {
                    battery_level: battery,
                    steps: (accel_count / 50) as u32,
                    ..Vitals::default()
                })
                .await?;
            last_vitals = Instant::now();
        }

        // Update live status every 2 seconds
        if last_status_update.elapsed() >= Duration::from_secs(2) {
            let mut live = LiveStatus::new(&linked.code);
            live.timestamp = live_status::current_timestamp();
            live.uptime_seconds = start.elapsed().as_secs();
            live.apply_session(&status);
            live.apply_health(&health.check());
            live.accel_samples = accel_count;
            live.sound_samples = sound_count;
            live.button_presses = press_count;
            live.impact_still_samples = impact.low_motion_samples();
            if let Some(view) = caregiver_handle.view(&linked.code).await? {
                live.caregiver_tag = format!("{:?}", view.last_tag);
                live.caregiver_alarm = format!("{:?}", view.alarm);
            }
            if let Some(local) = mirror.latest() {
                println!("[{}] {} | {}", ts_now(), local.summary(), health.format_status());
            }

            let status_path = format!("{}/live_status.json", args.output_dir);
            let _ = live.save(&status_path);
            last_status_update = Instant::now();
        }

        sleep(Duration::from_millis(10)).await;
    }

    let final_status = session.status();
    session.sign_out().await?;
    mailbox.detach();
    let view = caregiver_handle.view(&linked.code).await?;
    caregiver_handle.shutdown().await?;

    let dump_path = format!("{}/store_dump.json", args.output_dir);
    store.save_to_file(&dump_path)?;
    println!("[{}] Store written to {}", ts_now(), dump_path);

    println!("\n=== Final Stats ===");
    println!("State: {}", final_status.state);
    println!("Accel samples: {}", accel_count);
    println!("Sound frames: {}", sound_count);
    println!("Button presses: {}", press_count);
    println!(
        "Signals accepted: {} (suppressed: {} active, {} disabled, {} cooldown)",
        final_status.stats.accepted,
        final_status.stats.already_active,
        final_status.stats.source_disabled,
        final_status.stats.cooldown
    );
    println!("Store writes: {}", store.write_count());
    if let Some(view) = view {
        println!(
            "Caregiver: {} updates applied, {} stale dropped, alarm {:?}",
            view.applied, view.stale_dropped, view.alarm
        );
    }

    Ok(())
}

fn report(session: &safenest_core::session::SessionHandle, signal: Signal) {
    println!("[{}] {}", ts_now(), signal.describe());
    if let Err(e) = session.try_report(signal) {
        eprintln!("[{}] report dropped: {}", ts_now(), e);
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
