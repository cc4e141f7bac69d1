//! In-memory state record for a single printer.
//!
//! Owned by that printer's telemetry task, updated on every inbound MQTT
//! message, and read by the Dispatcher through a mutex-guarded snapshot.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN_SECONDS: u64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub global_status: i64,
    pub error_code: i64,
    pub progress_percent: i64,
    pub nozzle_temperature: Option<f64>,
    pub bed_temperature: Option<f64>,
    pub connected: bool,
    pub cooling_down: bool,
}

struct Inner {
    global_status: i64,
    error_code: i64,
    progress_percent: i64,
    nozzle_temperature: Option<f64>,
    bed_temperature: Option<f64>,
    connected: bool,
    last_finish_wall_time: Option<Instant>,
    cooling_down: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            global_status: -1,
            error_code: 0,
            progress_percent: 0,
            nozzle_temperature: None,
            bed_temperature: None,
            connected: false,
            last_finish_wall_time: None,
            cooling_down: false,
        }
    }
}

/// Fields lifted from an inbound `print` report subobject (`g_st`,
/// `print_error`, `mc_percent`, `nozzle_temper`, `bed_temper`).
#[derive(Debug, Clone, Default)]
pub struct TelemetryUpdate {
    pub global_status: Option<i64>,
    pub error_code: Option<i64>,
    pub progress_percent: Option<i64>,
    pub nozzle_temperature: Option<f64>,
    pub bed_temperature: Option<f64>,
}

/// Thread-safe holder for one printer's last-known telemetry.
pub struct PrinterState {
    inner: Mutex<Inner>,
    cooldown: Duration,
}

impl PrinterState {
    pub fn new() -> Self {
        Self::with_cooldown_secs(DEFAULT_COOLDOWN_SECONDS)
    }

    pub fn with_cooldown_secs(seconds: u64) -> Self {
        PrinterState {
            inner: Mutex::new(Inner::default()),
            cooldown: Duration::from_secs(seconds),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }

    /// Applies a telemetry update. Returns `true` iff `global_status` or
    /// `progress_percent` actually changed (lets callers throttle logging).
    pub fn update(&self, update: TelemetryUpdate) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let previous_status = inner.global_status;
        let previous_progress = inner.progress_percent;

        if let Some(v) = update.global_status {
            inner.global_status = v;
        }
        if let Some(v) = update.error_code {
            inner.error_code = v;
        }
        if let Some(v) = update.progress_percent {
            inner.progress_percent = v;
        }
        if update.nozzle_temperature.is_some() {
            inner.nozzle_temperature = update.nozzle_temperature;
        }
        if update.bed_temperature.is_some() {
            inner.bed_temperature = update.bed_temperature;
        }

        let new_status = inner.global_status;
        let new_progress = inner.progress_percent;

        let completed_by_status = previous_status == 6 && (new_status == 100 || new_status == 1);
        let completed_by_progress = previous_progress < 100 && new_progress == 100;

        if completed_by_status || completed_by_progress {
            inner.last_finish_wall_time = Some(Instant::now());
            inner.cooling_down = true;
        }

        new_status != previous_status || new_progress != previous_progress
    }

    /// If cooling and the cooldown window has elapsed, clears `cooling_down`
    /// and returns true. If still cooling, returns false. If never cooling,
    /// returns true.
    pub fn check_cooldown(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.cooling_down {
            return true;
        }
        let elapsed = inner
            .last_finish_wall_time
            .map(|t| t.elapsed() >= self.cooldown)
            .unwrap_or(true);
        if elapsed {
            inner.cooling_down = false;
            true
        } else {
            false
        }
    }

    /// `(bool, reason)`: cooldown gates first; otherwise safe iff
    /// `global_status == 1` or (`global_status == -1` and `error_code == 0`
    /// and `progress_percent` in {0, 100}).
    pub fn is_safe_to_print(&self) -> (bool, Option<String>) {
        if !self.check_cooldown() {
            return (false, Some("cooling".to_string()));
        }

        let inner = self.inner.lock().unwrap();
        let likely_idle = inner.global_status == 1
            || (inner.global_status == -1
                && inner.error_code == 0
                && (inner.progress_percent == 0 || inner.progress_percent == 100));

        if likely_idle {
            (true, None)
        } else {
            (
                false,
                Some(format!(
                    "status={} error={} progress={}",
                    inner.global_status, inner.error_code, inner.progress_percent
                )),
            )
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        StateSnapshot {
            global_status: inner.global_status,
            error_code: inner.error_code,
            progress_percent: inner.progress_percent,
            nozzle_temperature: inner.nozzle_temperature,
            bed_temperature: inner.bed_temperature,
            connected: inner.connected,
            cooling_down: inner.cooling_down,
        }
    }
}

impl Default for PrinterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(global: i64, progress: i64) -> TelemetryUpdate {
        TelemetryUpdate {
            global_status: Some(global),
            progress_percent: Some(progress),
            ..Default::default()
        }
    }

    #[test]
    fn completion_detected_via_status_transition() {
        let state = PrinterState::new();
        state.update(status(6, 42));
        assert!(!state.update(status(6, 87)));
        assert!(state.update(status(1, 100)));
    }

    #[test]
    fn completion_detected_via_progress_alone() {
        let state = PrinterState::new();
        state.update(status(0, 99));
        assert!(state.update(status(0, 100)));
    }

    #[test]
    fn changed_flag_is_false_on_steady_state() {
        let state = PrinterState::new();
        state.update(status(0, 50));
        assert!(!state.update(status(0, 50)));
    }

    #[test]
    fn cooldown_gates_safety_until_elapsed() {
        let state = PrinterState::with_cooldown_secs(0);
        state.update(status(6, 50));
        state.update(status(1, 100));
        // cooldown of 0s should clear immediately on the next check.
        let (safe, reason) = state.is_safe_to_print();
        assert!(safe, "{reason:?}");
    }

    #[test]
    fn still_cooling_blocks_dispatch() {
        let state = PrinterState::with_cooldown_secs(60);
        state.update(status(6, 50));
        state.update(status(1, 100));
        let (safe, reason) = state.is_safe_to_print();
        assert!(!safe);
        assert_eq!(reason.as_deref(), Some("cooling"));
    }

    #[test]
    fn busy_status_blocks_dispatch() {
        let state = PrinterState::new();
        state.update(status(6, 10));
        let (safe, _) = state.is_safe_to_print();
        assert!(!safe);
    }

    #[test]
    fn unknown_status_with_clean_error_and_edge_progress_is_safe() {
        let state = PrinterState::new();
        state.update(TelemetryUpdate {
            global_status: Some(-1),
            error_code: Some(0),
            progress_percent: Some(0),
            ..Default::default()
        });
        let (safe, _) = state.is_safe_to_print();
        assert!(safe);
    }

    #[test]
    fn unknown_status_with_error_is_unsafe() {
        let state = PrinterState::new();
        state.update(TelemetryUpdate {
            global_status: Some(-1),
            error_code: Some(7),
            progress_percent: Some(0),
            ..Default::default()
        });
        let (safe, _) = state.is_safe_to_print();
        assert!(!safe);
    }
}
