//! Energy-based VAD using an RMS level in dBFS and a fixed threshold.
//!
//! ## Algorithm
//!
//! 1. `rms = sqrt(sum(s^2) / n)`, floored at 1.0 so silence stays finite.
//! 2. `energy = 20 * log10(rms / 32767)`.
//! 3. Active iff `energy > threshold` (strictly).
//! 4. On inactive → active, record the start instant and zero `duration_ms`;
//!    while active, `duration_ms = now - start`.
//!
//! No smoothing or hangover: a single quiet chunk ends the activation.

use std::time::Instant;

use super::{VadTransition, VoiceActivity, VoiceActivityDetector};

/// Threshold used when none is configured (dBFS).
pub const DEFAULT_THRESHOLD_DB: f32 = -40.0;

/// Energy reported for an empty chunk (dBFS).
pub const EMPTY_ENERGY_DB: f32 = -96.0;

const FULL_SCALE: f32 = 32767.0;

/// Energy of a sample block in dBFS.
///
/// Returns `EMPTY_ENERGY_DB` for an empty slice. All-zero input bottoms out
/// at `20 * log10(1 / 32767)` ≈ −90.3 dBFS because of the RMS floor.
pub fn energy_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return EMPTY_ENERGY_DB;
    }
    let sum_squares: i64 = samples.iter().map(|&s| (s as i64) * (s as i64)).sum();
    let rms = (sum_squares as f32 / samples.len() as f32).sqrt().max(1.0);
    20.0 * (rms / FULL_SCALE).log10()
}

/// A simple energy-threshold voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold_db: f32,
    activity: VoiceActivity,
    activity_start: Option<Instant>,
}

impl EnergyVad {
    pub fn new(threshold_db: f32) -> Self {
        Self {
            threshold_db,
            activity: VoiceActivity::default(),
            activity_start: None,
        }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD_DB)
    }
}

fn elapsed_ms(start: Instant, now: Instant) -> u32 {
    now.saturating_duration_since(start)
        .as_millis()
        .min(u32::MAX as u128) as u32
}

impl VoiceActivityDetector for EnergyVad {
    fn update(&mut self, samples: &[i16], now: Instant) -> VadTransition {
        let energy = energy_db(samples);
        self.activity.energy_db = energy;

        let was_active = self.activity.is_active;
        let is_active = energy > self.threshold_db;
        self.activity.is_active = is_active;

        match (was_active, is_active) {
            (false, true) => {
                self.activity_start = Some(now);
                self.activity.duration_ms = 0;
                VadTransition::Started
            }
            (true, true) => {
                if let Some(start) = self.activity_start {
                    self.activity.duration_ms = elapsed_ms(start, now);
                }
                VadTransition::Unchanged
            }
            (true, false) => {
                self.activity.last_utterance_ms = self.activity.duration_ms;
                VadTransition::Ended
            }
            (false, false) => VadTransition::Unchanged,
        }
    }

    fn activity(&self) -> VoiceActivity {
        self.activity
    }
}
