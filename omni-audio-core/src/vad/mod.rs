//! Voice Activity Detection (VAD).
//!
//! `VoiceActivityDetector` is the seam the pipeline talks to; `EnergyVad`
//! (fixed dBFS threshold) is the only detector the board ships with.

pub mod energy;

pub use energy::{energy_db, EnergyVad, DEFAULT_THRESHOLD_DB, EMPTY_ENERGY_DB};

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Snapshot of detector state, safe to hand to LED / UI pollers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceActivity {
    /// Whether the latest chunk exceeded the threshold.
    pub is_active: bool,
    /// Energy of the latest chunk in dBFS.
    pub energy_db: f32,
    /// Time since the current activation started.
    ///
    /// Not cleared when activity ends: it keeps the length of the last
    /// utterance until the next activation resets it to 0.
    pub duration_ms: u32,
    /// Length of the most recently completed utterance.
    pub last_utterance_ms: u32,
}

impl Default for VoiceActivity {
    fn default() -> Self {
        Self {
            is_active: false,
            energy_db: EMPTY_ENERGY_DB,
            duration_ms: 0,
            last_utterance_ms: 0,
        }
    }
}

/// Edge reported by a detector update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    /// Inactive → active.
    Started,
    /// Active → inactive.
    Ended,
    /// No edge.
    Unchanged,
}

/// Trait for all VAD implementations.
pub trait VoiceActivityDetector: Send + 'static {
    /// Feed one chunk of 16 kHz mono samples observed at `now`.
    fn update(&mut self, samples: &[i16], now: Instant) -> VadTransition;

    /// Current state snapshot. Never mutates.
    fn activity(&self) -> VoiceActivity;
}
