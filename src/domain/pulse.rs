//! Heartbeat Pulse Generator
//!
//! Turns a BPM value into a binary heartbeat waveform. A frame loop running
//! at roughly 60 Hz drives two observable outputs:
//!
//! - **toggle** flips once per beat
//! - **pulse** goes high at each beat and drops after the pulse duration
//!
//! Small BPM corrections keep the current rhythm; step changes re-align the
//! phase so the next beat lands a quarter interval after the change.

use crate::domain::signal::Signal;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

pub const MIN_BPM: u16 = 30;
pub const MAX_BPM: u16 = 220;
pub const DEFAULT_PULSE_DURATION_MS: u64 = 200;

/// Frame period of the timing loop (~60 FPS)
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Relative BPM change above which the beat phase is reset
const RESYNC_THRESHOLD: f32 = 0.2;

/// Output changes produced by one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOutput {
    pub toggle: Option<bool>,
    pub pulse: Option<bool>,
}

/// Beat scheduling state, independent of any clock source.
#[derive(Debug)]
pub struct PulseTimer {
    current_bpm: u16,
    next_pulse_time: Option<Instant>,
    pulse_end_time: Option<Instant>,
    pulse_duration: Duration,
    toggle: bool,
    pulse_on: bool,
}

impl Default for PulseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PulseTimer {
    pub fn new() -> Self {
        Self {
            current_bpm: 0,
            next_pulse_time: None,
            pulse_end_time: None,
            pulse_duration: Duration::from_millis(DEFAULT_PULSE_DURATION_MS),
            toggle: false,
            pulse_on: false,
        }
    }

    /// Beat interval for a BPM value, truncated to whole milliseconds
    pub fn beat_interval(bpm: u16) -> Duration {
        Duration::from_millis(beat_interval_ms(bpm))
    }

    /// Set the target BPM. Returns the clamped value actually applied.
    pub fn start(&mut self, bpm: u16, now: Instant) -> u16 {
        let valid_bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        if valid_bpm != bpm {
            warn!("BPM {} out of range, clamped to {}", bpm, valid_bpm);
        }

        let old_bpm = self.current_bpm;
        if old_bpm == valid_bpm {
            return valid_bpm;
        }
        self.current_bpm = valid_bpm;

        let delta = if old_bpm > 0 {
            f32::from(valid_bpm.abs_diff(old_bpm)) / f32::from(old_bpm)
        } else {
            1.0
        };

        if old_bpm == 0 || self.next_pulse_time.is_none() || delta > RESYNC_THRESHOLD {
            // Quarter beat, also in whole milliseconds
            let offset = Duration::from_millis(beat_interval_ms(valid_bpm) / 4);
            self.next_pulse_time = Some(now + offset);
            self.pulse_end_time = None;
            debug!(
                "BPM changed significantly: {} -> {} ({}% change), reset timing",
                old_bpm,
                valid_bpm,
                (delta * 100.0) as u32
            );
        } else {
            debug!(
                "BPM changed slightly: {} -> {}, timing preserved",
                old_bpm, valid_bpm
            );
        }

        valid_bpm
    }

    /// Return to idle. The caller is responsible for forcing outputs low.
    pub fn stop(&mut self) {
        self.current_bpm = 0;
        self.next_pulse_time = None;
        self.pulse_end_time = None;
        self.toggle = false;
        self.pulse_on = false;
    }

    pub fn set_pulse_duration(&mut self, duration_ms: u64) {
        self.pulse_duration = Duration::from_millis(duration_ms.max(1));
    }

    /// Advance one frame at time `now`.
    pub fn tick(&mut self, now: Instant) -> FrameOutput {
        let mut output = FrameOutput::default();

        if let Some(next) = self.next_pulse_time {
            if self.current_bpm > 0 && now >= next {
                let interval = Self::beat_interval(self.current_bpm);

                self.toggle = !self.toggle;
                self.pulse_on = true;
                self.pulse_end_time = Some(now + self.pulse_duration);
                output.toggle = Some(self.toggle);
                output.pulse = Some(true);

                let mut next = next + interval;
                // Fell behind (missed beats): re-anchor on now instead of bursting
                if next < now {
                    next = now + interval;
                    debug!("Pulse timing reset - caught up to current time");
                }
                self.next_pulse_time = Some(next);

                trace!(
                    "Pulse triggered at {} BPM, next pulse in {}ms",
                    self.current_bpm,
                    interval.as_millis()
                );
            }
        }

        if self.pulse_on && self.pulse_end_time.map_or(true, |end| now >= end) {
            self.pulse_on = false;
            output.pulse = Some(false);
        }

        output
    }

    pub fn current_bpm(&self) -> u16 {
        self.current_bpm
    }

    pub fn next_pulse_time(&self) -> Option<Instant> {
        self.next_pulse_time
    }

    pub fn pulse_duration(&self) -> Duration {
        self.pulse_duration
    }
}

fn beat_interval_ms(bpm: u16) -> u64 {
    if bpm == 0 {
        return 0;
    }
    60_000 / u64::from(bpm)
}

/// Shared between the public handle and the frame loop
struct Shared {
    timer: Mutex<PulseTimer>,
    toggle: Signal<bool>,
    pulse: Signal<bool>,
}

impl Shared {
    fn timer(&self) -> MutexGuard<'_, PulseTimer> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_frame(&self, now: Instant) {
        // Outputs are published under the timer lock so a concurrent stop()
        // cannot be overtaken by a stale frame.
        let mut timer = self.timer();
        let output = timer.tick(now);
        if let Some(toggle) = output.toggle {
            self.toggle.set(toggle);
        }
        if let Some(pulse) = output.pulse {
            self.pulse.set(pulse);
        }
    }
}

/// Owns the frame loop task and exposes the toggle/pulse signals.
pub struct PulseGenerator {
    shared: Arc<Shared>,
    frame_task: Mutex<Option<JoinHandle<()>>>,
}

impl PulseGenerator {
    /// Create the generator and start its frame loop on the current runtime.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            timer: Mutex::new(PulseTimer::new()),
            toggle: Signal::new(false),
            pulse: Signal::new(false),
        });

        let loop_shared = shared.clone();
        let frame_task = tokio::spawn(async move {
            let mut frames = tokio::time::interval(FRAME_INTERVAL);
            frames.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                frames.tick().await;
                loop_shared.run_frame(Instant::now());
            }
        });
        debug!("Animation loop started");

        Self {
            shared,
            frame_task: Mutex::new(Some(frame_task)),
        }
    }

    pub fn start(&self, bpm: u16) {
        self.shared.timer().start(bpm, Instant::now());
    }

    pub fn stop(&self) {
        let mut timer = self.shared.timer();
        timer.stop();
        self.shared.toggle.set(false);
        self.shared.pulse.set(false);
        debug!("Heartbeat stopped");
    }

    pub fn set_pulse_duration(&self, duration_ms: u64) {
        let mut timer = self.shared.timer();
        timer.set_pulse_duration(duration_ms);
        debug!(
            "Pulse duration set to {}ms",
            timer.pulse_duration().as_millis()
        );
    }

    pub fn is_running(&self) -> bool {
        self.current_bpm() > 0
    }

    pub fn current_bpm(&self) -> u16 {
        self.shared.timer().current_bpm()
    }

    pub fn pulse_duration(&self) -> Duration {
        self.shared.timer().pulse_duration()
    }

    pub fn toggle_state(&self) -> bool {
        self.shared.toggle.get()
    }

    pub fn pulse_state(&self) -> bool {
        self.shared.pulse.get()
    }

    pub fn subscribe_toggle(&self) -> broadcast::Receiver<bool> {
        self.shared.toggle.subscribe()
    }

    pub fn subscribe_pulse(&self) -> broadcast::Receiver<bool> {
        self.shared.pulse.subscribe()
    }

    /// Stop and cancel the frame loop. Safe to call more than once.
    pub fn cleanup(&self) {
        self.stop();
        let task = self
            .frame_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            debug!("Animation loop cleaned up");
        }
    }
}

impl Default for PulseGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PulseGenerator {
    fn drop(&mut self) {
        if let Some(task) = self
            .frame_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
