//! # omni-audio-core
//!
//! Full-duplex audio pipeline for a voice assistant board.
//!
//! ## Architecture
//!
//! ```text
//! I2S mic ─(read loop)─┐
//!                      ├─► process_mic_data ─┬─► raw ring (48 kHz)        ─► read_raw()
//! USB mic ─(events)────┘                     ├─► mono mix + ÷3 decimation
//!                                            │       └─► processed ring  ─► read()
//!                                            └─► EnergyVad ─► broadcast::Sender<VoiceActivityEvent>
//!
//! write() ─► output ring ─► process(): volume/mute ─► DacSink
//! ```
//!
//! The capture path never blocks for longer than its bounded lock wait: a
//! chunk that can't be placed is dropped and counted in `PipelineStats`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{
    device::{list_input_devices, InputDeviceInfo, UsbDeviceInfo},
    sink::{DacSink, NullSink, WavSink},
    source::{
        I2sMic, I2sMicConfig, MicReader, SampleSource, SourceEvent, UsbMic, UsbMicConfig,
        WavFileMic,
    },
    DeviceCapture,
};
pub use buffering::{pcm::AudioFormat, ByteRing};
pub use engine::{AudioPipeline, PipelineConfig};
pub use error::{AudioError, Result};
pub use ipc::events::{
    BufferLevels, PipelineState, PipelineStateEvent, PipelineStats, VoiceActivityEvent,
};
pub use vad::{EnergyVad, VoiceActivity};
