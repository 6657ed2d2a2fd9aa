use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Single-shot countdown tagged with a state generation.
///
/// At most one countdown is armed at a time; arming again or disarming aborts
/// the previous task. The fired event still carries its generation so the
/// receiver can drop one that raced with a disarm.
pub struct CountdownTimer {
    armed: Option<(u64, JoinHandle<()>)>,
}

impl CountdownTimer {
    pub fn new() -> Self {
        Self { armed: None }
    }

    pub fn arm<E: Send + 'static>(
        &mut self,
        generation: u64,
        duration: Duration,
        tx: mpsc::UnboundedSender<E>,
        event: E,
    ) {
        self.disarm();
        let handle = tokio::spawn(async move {
            sleep(duration).await;
            let _ = tx.send(event);
        });
        debug!("[STATE] countdown gen {} armed for {:?}", generation, duration);
        self.armed = Some((generation, handle));
    }

    /// Aborts the live countdown, returning its generation.
    pub fn disarm(&mut self) -> Option<u64> {
        let (generation, handle) = self.armed.take()?;
        handle.abort();
        debug!("[STATE] countdown gen {} disarmed", generation);
        Some(generation)
    }

    pub fn armed_generation(&self) -> Option<u64> {
        match &self.armed {
            Some((generation, handle)) if !handle.is_finished() => Some(*generation),
            _ => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed_generation().is_some()
    }
}

impl Default for CountdownTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
