//! Event and status types published by the audio pipeline.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `VoiceActivityEvent` | `AudioPipeline::subscribe_activity` |
//! | `PipelineStateEvent` | `AudioPipeline::subscribe_state` |
//!
//! `PipelineStats` and `BufferLevels` are polled snapshots.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pipeline state
// ---------------------------------------------------------------------------

/// Lifecycle state of an `AudioPipeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Created (or deinitialized), no buffers allocated.
    Uninitialized,
    /// Buffers allocated, capture running, nothing playing.
    Idle,
    /// Output ring is drained to the DAC.
    Playing,
    /// Capture feeds are being consumed.
    Recording,
    /// Playing and recording at the same time.
    Duplex,
    /// Bring-up failed; a fresh `init()` is required.
    Error,
}

impl PipelineState {
    /// Whether `process()` drains the output ring in this state.
    pub fn is_playing(self) -> bool {
        matches!(self, Self::Playing | Self::Duplex)
    }
}

/// Published whenever the pipeline changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStateEvent {
    pub state: PipelineState,
    /// Optional human-readable detail (e.g. bring-up error).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Voice activity
// ---------------------------------------------------------------------------

/// Published on every VAD active/inactive edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub is_active: bool,
    /// Energy of the chunk that caused the edge, in dBFS.
    pub energy_db: f32,
    /// Utterance length so far (0 on activation, final length on release).
    pub duration_ms: u32,
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Capacity and contention counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    /// `process()` found less than one output chunk buffered.
    pub underruns: u32,
    /// A processed (16 kHz) chunk did not fit and was dropped.
    pub overruns: u32,
    /// A raw capture chunk did not fit and was dropped.
    pub raw_overruns: u32,
    /// A bounded lock wait timed out and the operation was skipped.
    pub lock_misses: u32,
}

/// Ring fill levels as integer percentages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferLevels {
    pub output_pct: u8,
    /// Fill level of the processed (16 kHz mono) ring.
    pub input_pct: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_event_serializes_with_lowercase_state() {
        let event = PipelineStateEvent {
            state: PipelineState::Duplex,
            detail: Some("record_start while playing".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["state"], "duplex");
        assert_eq!(json["detail"], "record_start while playing");

        let round_trip: PipelineStateEvent =
            serde_json::from_value(json).expect("deserialize state event");
        assert_eq!(round_trip.state, PipelineState::Duplex);
    }

    #[test]
    fn state_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<PipelineState>(r#""Playing""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn activity_event_serializes_with_camel_case_fields() {
        let event = VoiceActivityEvent {
            seq: 4,
            is_active: true,
            energy_db: -12.5,
            duration_ms: 0,
        };

        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["isActive"], true);
        assert_eq!(json["durationMs"], 0);
        let db = json["energyDb"].as_f64().expect("energyDb should be a number");
        assert!((db + 12.5).abs() < 1e-6);
    }

    #[test]
    fn stats_serialize_with_camel_case_fields() {
        let stats = PipelineStats {
            underruns: 1,
            overruns: 2,
            raw_overruns: 3,
            lock_misses: 4,
        };
        let json = serde_json::to_value(stats).expect("serialize stats");
        assert_eq!(json["rawOverruns"], 3);
        assert_eq!(json["lockMisses"], 4);
    }

    #[test]
    fn only_playing_states_drain_output() {
        assert!(PipelineState::Playing.is_playing());
        assert!(PipelineState::Duplex.is_playing());
        assert!(!PipelineState::Recording.is_playing());
        assert!(!PipelineState::Idle.is_playing());
    }
}
