//! Debounced alert state machine.
//!
//! `Idle -> Active` happens on a reported detection when more than the
//! cooldown has passed since the last acknowledgement (or nothing has been
//! acknowledged yet). While `Active`, further detections are absorbed and the
//! sound is not restarted. `acknowledge()` always returns to `Idle`, stops the
//! sound and re-anchors the cooldown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::sound::AlertSound;

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Snapshot for status polling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertStatus {
    pub active: bool,
    pub anomaly: Option<String>,
}

#[derive(Debug, Default)]
struct AlertState {
    active: bool,
    last_acknowledged: Option<Instant>,
    anomaly: Option<String>,
}

pub struct AlertController {
    state: Mutex<AlertState>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    sound: Arc<dyn AlertSound>,
    activations: AtomicU64,
}

impl AlertController {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>, sound: Arc<dyn AlertSound>) -> Self {
        Self {
            state: Mutex::new(AlertState::default()),
            cooldown,
            clock,
            sound,
            activations: AtomicU64::new(0),
        }
    }

    pub fn with_system_clock(cooldown: Duration, sound: Arc<dyn AlertSound>) -> Self {
        Self::new(cooldown, Arc::new(SystemClock), sound)
    }

    fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Report an accepted detection. Returns true if this moved the alert to `Active`.
    pub fn report_detection(&self, category: &str) -> bool {
        let mut state = self.lock();
        if state.active {
            return false;
        }
        let now = self.clock.now();
        let cooled_down = match state.last_acknowledged {
            Some(at) => now.saturating_duration_since(at) > self.cooldown,
            None => true,
        };
        if !cooled_down {
            return false;
        }

        state.active = true;
        state.anomaly = Some(category.to_string());
        self.activations.fetch_add(1, Ordering::SeqCst);
        log::warn!("alert raised: {}", category);

        // Playback only spawns the player; held under the lock so a
        // concurrent acknowledge cannot stop it before it starts.
        if let Err(e) = self.sound.play() {
            log::warn!("alert sound unavailable: {:#}", e);
        }
        true
    }

    /// Return to `Idle`, stop the sound and restart the cooldown window.
    pub fn acknowledge(&self) {
        let mut state = self.lock();
        let was_active = state.active;
        state.active = false;
        state.anomaly = None;
        state.last_acknowledged = Some(self.clock.now());
        if was_active {
            log::info!("alert acknowledged");
        }
        if let Err(e) = self.sound.stop() {
            log::warn!("failed to stop alert sound: {:#}", e);
        }
    }

    pub fn status(&self) -> AlertStatus {
        let state = self.lock();
        AlertStatus {
            active: state.active,
            anomaly: state.anomaly.clone(),
        }
    }

    /// Number of `Idle -> Active` transitions so far.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }
}
