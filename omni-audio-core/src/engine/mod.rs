//! `AudioPipeline`: top-level lifecycle and routing controller.
//!
//! ## Lifecycle
//!
//! ```text
//! AudioPipeline::new(config)          state = Uninitialized
//!     └─► init(source, sink)          rings allocated, DAC enabled, capture started, state = Idle
//!         ├─► play / record_start …   Idle ⇄ Playing ⇄ Duplex ⇄ Recording
//!         └─► deinit()                capture joined, rings freed, state = Uninitialized
//! ```
//!
//! A failed `init()` releases everything it allocated and leaves the
//! pipeline in `Error`; only a fresh `init()` (or `deinit()`) leaves it.
//!
//! ## Threading
//!
//! `AudioPipeline` is a cheap `Clone` handle over shared state. Every method
//! takes `&self`, so one clone can sit in the audio service loop, one in the
//! app task and one in a UI poller. The capture thread holds only a weak
//! reference: dropping the last handle stops it.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    audio::{
        downsample::Downsampler,
        sink::DacSink,
        source::SampleSource,
    },
    buffering::{pcm::AudioFormat, ByteRing},
    error::{AudioError, Result},
    ipc::events::{
        BufferLevels, PipelineState, PipelineStateEvent, PipelineStats, VoiceActivityEvent,
    },
    vad::{EnergyVad, VoiceActivity, VoiceActivityDetector},
};

use self::pipeline::{InputStage, PipelineDiagnostics, Shared, SinkStage};

/// Configuration for `AudioPipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw capture ring capacity in bytes. Default: 64 KiB.
    pub raw_buffer_size: usize,
    /// Processed (16 kHz mono) ring capacity in bytes. Default: 16 KiB.
    pub processed_buffer_size: usize,
    /// Playback ring capacity in bytes. Default: 4096.
    pub output_buffer_size: usize,
    /// Rate of the processed feed. Must divide the mic rate exactly.
    pub processed_sample_rate: u32,
    /// Format the DAC expects from the playback ring.
    pub output_sample_rate: u32,
    pub output_channels: u16,
    /// Voice activity threshold in dBFS. Default: -40.
    pub vad_threshold_db: f32,
    /// Playback volume after `init()`, 0..=100. Default: 70.
    pub default_volume: u8,
    /// Bytes moved to the DAC per `process()` call. Default: 512.
    pub output_chunk_bytes: usize,
    /// Input-lock wait in the capture path. Default: 5 ms.
    pub capture_lock_timeout_ms: u64,
    /// Output-lock wait in `process()`. Default: 10 ms.
    pub process_lock_timeout_ms: u64,
    /// Output-lock wait in `stop()`. Default: 100 ms.
    pub stop_lock_timeout_ms: u64,
    /// DAC write timeout. Default: 10 ms.
    pub sink_write_timeout_ms: u64,
    /// Blocking mic read timeout, also the USB event poll interval. Default: 100 ms.
    pub capture_read_timeout_ms: u64,
    /// Sleep after a mic read error. Default: 10 ms.
    pub capture_error_backoff_ms: u64,
    /// Frames per I2S read (240 = 5 ms at 48 kHz).
    pub capture_frames: usize,
    /// Broadcast capacity for activity and state events. Default: 64.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_buffer_size: 64 * 1024,
            processed_buffer_size: 16 * 1024,
            output_buffer_size: 4096,
            processed_sample_rate: 16_000,
            output_sample_rate: 48_000,
            output_channels: 2,
            vad_threshold_db: crate::vad::DEFAULT_THRESHOLD_DB,
            default_volume: 70,
            output_chunk_bytes: 512,
            capture_lock_timeout_ms: 5,
            process_lock_timeout_ms: 10,
            stop_lock_timeout_ms: 100,
            sink_write_timeout_ms: 10,
            capture_read_timeout_ms: 100,
            capture_error_backoff_ms: 10,
            capture_frames: 240,
            event_capacity: 64,
        }
    }
}

impl PipelineConfig {
    /// Format of the playback ring / DAC.
    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.output_sample_rate, self.output_channels)
    }

    /// Format of the processed feed.
    pub fn processed_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.processed_sample_rate, 1)
    }

    /// # Errors
    /// `AudioError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AudioError::InvalidConfig(msg));

        for (name, size) in [
            ("rawBufferSize", self.raw_buffer_size),
            ("processedBufferSize", self.processed_buffer_size),
            ("outputBufferSize", self.output_buffer_size),
        ] {
            if size < 2 {
                return invalid(format!("{name} must be at least 2 bytes (got {size})"));
            }
        }
        if self.processed_sample_rate == 0 {
            return invalid("processedSampleRate must be non-zero".into());
        }
        if self.output_sample_rate == 0 || !(1..=2).contains(&self.output_channels) {
            return invalid(format!(
                "unsupported output format: {} Hz, {} channels",
                self.output_sample_rate, self.output_channels
            ));
        }
        if self.output_chunk_bytes == 0
            || self.output_chunk_bytes % 2 != 0
            || self.output_chunk_bytes >= self.output_buffer_size
        {
            return invalid(format!(
                "outputChunkBytes must be even, non-zero and below outputBufferSize (got {})",
                self.output_chunk_bytes
            ));
        }
        if self.default_volume > 100 {
            return invalid(format!(
                "defaultVolume must be 0..=100 (got {})",
                self.default_volume
            ));
        }
        if self.capture_frames == 0 {
            return invalid("captureFrames must be non-zero".into());
        }
        if self.event_capacity == 0 {
            return invalid("eventCapacity must be non-zero".into());
        }
        Ok(())
    }
}

/// Handle to one audio pipeline instance.
///
/// `AudioPipeline` is `Send + Sync` and `Clone`; clones share the instance.
#[derive(Clone)]
pub struct AudioPipeline {
    shared: Arc<Shared>,
}

impl AudioPipeline {
    /// Create an uninitialized pipeline. Nothing is allocated until `init()`.
    pub fn new(config: PipelineConfig) -> Self {
        let capacity = config.event_capacity.max(1);
        let (activity_tx, _) = broadcast::channel(capacity);
        let (state_tx, _) = broadcast::channel(capacity);
        let vad: Box<dyn VoiceActivityDetector> = Box::new(EnergyVad::new(config.vad_threshold_db));

        Self {
            shared: Arc::new(Shared {
                volume: AtomicU8::new(config.default_volume.min(100)),
                config,
                lifecycle: Mutex::new(()),
                initialized: AtomicBool::new(false),
                state: Mutex::new(PipelineState::Uninitialized),
                ready: Mutex::new(false),
                ready_cv: Condvar::new(),
                mic_ready: AtomicBool::new(false),
                input: Mutex::new(None),
                output: Mutex::new(None),
                sink: Mutex::new(None),
                vad: Mutex::new(vad),
                voice_active: AtomicBool::new(false),
                output_level: AtomicU8::new(0),
                input_level: AtomicU8::new(0),
                paused_from_duplex: AtomicBool::new(false),
                raw_format: Mutex::new(AudioFormat::pcm16(48_000, 1)),
                muted: AtomicBool::new(false),
                diagnostics: PipelineDiagnostics::default(),
                capture_running: Arc::new(AtomicBool::new(false)),
                capture_thread: Mutex::new(None),
                activity_seq: AtomicU64::new(0),
                activity_tx,
                state_tx,
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Allocate the rings, enable the DAC and start capturing from `source`.
    ///
    /// Allowed from `Uninitialized` and `Error`. Calling it on a running
    /// pipeline logs a warning and succeeds without touching anything.
    ///
    /// # Errors
    /// - `InvalidConfig` / `InvalidCapacity` for bad sizes.
    /// - `UnsupportedFormat` when the source rate or channel count can't be
    ///   decimated to the processed rate.
    /// - Whatever the sink's `enable()` returns.
    /// - `Io` if the capture thread can't be spawned.
    ///
    /// On error the pipeline is left in `Error` with nothing allocated.
    pub fn init<S: DacSink>(&self, source: SampleSource, sink: S) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock();

        if self.shared.initialized.load(Ordering::SeqCst) {
            warn!("audio pipeline already initialized");
            return Ok(());
        }

        info!(
            input = source.kind(),
            format = ?source.format(),
            "initializing audio pipeline"
        );

        match self.bring_up(source, Box::new(sink)) {
            Ok(()) => {
                info!("audio pipeline initialized");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "audio pipeline init failed");
                self.shared.tear_down();
                self.shared.set_state(PipelineState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn bring_up(&self, source: SampleSource, mut sink: Box<dyn DacSink>) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        config.validate()?;

        let format = source.format();
        let downsampler = Downsampler::new(
            format.channels,
            format.sample_rate,
            config.processed_sample_rate,
        )?;
        let vad = EnergyVad::new(config.vad_threshold_db);
        info!(
            ratio = downsampler.state().ratio,
            layout = ?downsampler.layout(),
            threshold_db = vad.threshold_db(),
            "capture path configured"
        );

        let raw = ByteRing::new(config.raw_buffer_size)?;
        let processed = ByteRing::new(config.processed_buffer_size)?;
        let output = ByteRing::new(config.output_buffer_size)?;

        sink.enable()?;

        *shared.input.lock() = Some(InputStage::new(raw, processed, downsampler));
        *shared.output.lock() = Some(output);
        *shared.sink.lock() = Some(SinkStage::new(sink, config.output_chunk_bytes));
        *shared.raw_format.lock() = format;
        *shared.vad.lock() = Box::new(vad);
        shared.voice_active.store(false, Ordering::Relaxed);
        shared.paused_from_duplex.store(false, Ordering::Relaxed);
        shared.diagnostics.reset();
        shared
            .volume
            .store(config.default_volume.min(100), Ordering::Relaxed);
        shared.muted.store(false, Ordering::Relaxed);

        shared.initialized.store(true, Ordering::SeqCst);
        shared.set_state(PipelineState::Idle, None);

        shared.capture_running.store(true, Ordering::SeqCst);
        let handle = match source {
            SampleSource::I2sMic(mic) => {
                let read_bytes = config.capture_frames * format.frame_bytes();
                let handle = pipeline::spawn_i2s_capture(shared, mic.reader, read_bytes)?;
                shared.mic_ready.store(true, Ordering::Release);
                shared.set_ready(true);
                handle
            }
            // Ready once the adapter reports a connected device.
            SampleSource::UsbMic(mic) => pipeline::spawn_usb_pump(shared, mic.events)?,
        };
        *shared.capture_thread.lock() = Some(handle);

        Ok(())
    }

    /// Stop capture, disable the DAC and free every ring. Idempotent.
    pub fn deinit(&self) {
        let _lifecycle = self.shared.lifecycle.lock();

        if *self.shared.state.lock() == PipelineState::Uninitialized {
            return;
        }

        info!("deinitializing audio pipeline");
        self.shared.tear_down();
        *self.shared.vad.lock() = Box::new(EnergyVad::new(self.shared.config.vad_threshold_db));
        self.shared.voice_active.store(false, Ordering::Relaxed);
        self.shared.paused_from_duplex.store(false, Ordering::Relaxed);
        self.shared.set_state(PipelineState::Uninitialized, None);
        info!("audio pipeline deinitialized");
    }

    /// Block until the microphone is streaming, up to `timeout_ms`.
    ///
    /// # Errors
    /// `NotInitialized` before `init()`, `Timeout` if the mic never came up.
    pub fn wait_ready(&self, timeout_ms: u64) -> Result<()> {
        if !self.shared.initialized.load(Ordering::Acquire) {
            return Err(AudioError::NotInitialized);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut ready = self.shared.ready.lock();
        while !*ready {
            if self
                .shared
                .ready_cv
                .wait_until(&mut ready, deadline)
                .timed_out()
            {
                break;
            }
        }

        if *ready {
            Ok(())
        } else {
            Err(AudioError::Timeout { timeout_ms })
        }
    }

    /// Whether a microphone is currently connected and streaming.
    pub fn mic_connected(&self) -> bool {
        self.shared.mic_ready.load(Ordering::Acquire)
    }

    /// Service hook: move one output chunk to the DAC when playing.
    ///
    /// Call every few milliseconds from the audio service loop.
    pub fn process(&self) {
        self.shared.process_output();
    }

    /// Push one capture chunk through the pipeline.
    ///
    /// The capture thread calls this for every read. It is public so a
    /// caller that owns its own capture loop can feed the pipeline directly.
    pub fn process_mic_data(&self, data: &[u8]) {
        self.shared.process_mic_data(data);
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    /// `Idle`/`Recording` → `Playing`. A no-op when already playing.
    pub fn play(&self) -> Result<()> {
        self.transition("play", |state, _| match state {
            PipelineState::Idle | PipelineState::Recording => Some(PipelineState::Playing),
            _ => None,
        })
    }

    /// Back to `Idle` and discard any queued playback. Capture feeds are kept.
    pub fn stop(&self) -> Result<()> {
        self.transition("stop", |_, _| Some(PipelineState::Idle))?;

        let timeout = Duration::from_millis(self.shared.config.stop_lock_timeout_ms);
        match self.shared.output.try_lock_for(timeout) {
            Some(mut output) => {
                if let Some(ring) = output.as_mut() {
                    ring.reset();
                    self.shared.output_level.store(0, Ordering::Relaxed);
                }
            }
            None => {
                self.shared.lock_miss("stop");
                warn!("stop: output ring busy, queued playback not cleared");
            }
        }
        Ok(())
    }

    /// `Playing` → `Idle`, `Duplex` → `Recording`. Queued playback is kept.
    pub fn pause(&self) -> Result<()> {
        self.transition("pause", |state, _| match state {
            PipelineState::Playing => Some(PipelineState::Idle),
            PipelineState::Duplex => Some(PipelineState::Recording),
            _ => None,
        })
    }

    /// Undo `pause`: back to `Duplex` if the pause came from `Duplex` and
    /// recording is still on, otherwise the same as `play`.
    pub fn resume(&self) -> Result<()> {
        self.transition("resume", |state, paused_from_duplex| match state {
            PipelineState::Recording if paused_from_duplex => Some(PipelineState::Duplex),
            PipelineState::Idle | PipelineState::Recording => Some(PipelineState::Playing),
            _ => None,
        })
    }

    /// Queue PCM for playback. Returns the bytes accepted, truncated to free
    /// space; 0 on lock timeout or before `init()`.
    pub fn write(&self, data: &[u8], timeout_ms: u64) -> usize {
        if !self.shared.initialized.load(Ordering::Acquire) || data.is_empty() {
            return 0;
        }
        let Some(mut output) = self
            .shared
            .output
            .try_lock_for(Duration::from_millis(timeout_ms))
        else {
            self.shared.lock_miss("write");
            return 0;
        };
        output.as_mut().map_or(0, |ring| {
            let written = ring.write(data);
            self.shared
                .output_level
                .store(ring.fill_percent(), Ordering::Relaxed);
            written
        })
    }

    // ── Recording ────────────────────────────────────────────────────────────

    /// `Idle` → `Recording`, `Playing` → `Duplex`.
    pub fn record_start(&self) -> Result<()> {
        self.transition("record_start", |state, _| match state {
            PipelineState::Idle => Some(PipelineState::Recording),
            PipelineState::Playing => Some(PipelineState::Duplex),
            _ => None,
        })
    }

    /// `Recording` → `Idle`, `Duplex` → `Playing`.
    pub fn record_stop(&self) -> Result<()> {
        self.transition("record_stop", |state, _| match state {
            PipelineState::Recording => Some(PipelineState::Idle),
            PipelineState::Duplex => Some(PipelineState::Playing),
            _ => None,
        })
    }

    /// Drain up to `out.len()` bytes of 16 kHz mono PCM.
    ///
    /// Capture runs in every initialized state, so data is available
    /// whether or not recording was started.
    pub fn read(&self, out: &mut [u8], timeout_ms: u64) -> usize {
        self.read_input(out, timeout_ms, |stage| &mut stage.processed)
    }

    /// Drain up to `out.len()` bytes of the unmodified capture stream.
    pub fn read_raw(&self, out: &mut [u8], timeout_ms: u64) -> usize {
        self.read_input(out, timeout_ms, |stage| &mut stage.raw)
    }

    fn read_input(
        &self,
        out: &mut [u8],
        timeout_ms: u64,
        ring: impl FnOnce(&mut InputStage) -> &mut ByteRing,
    ) -> usize {
        if !self.shared.initialized.load(Ordering::Acquire) || out.is_empty() {
            return 0;
        }
        let Some(mut input) = self
            .shared
            .input
            .try_lock_for(Duration::from_millis(timeout_ms))
        else {
            self.shared.lock_miss("read");
            return 0;
        };
        input.as_mut().map_or(0, |stage| {
            let n = ring(stage).read(out);
            self.shared
                .input_level
                .store(stage.processed.fill_percent(), Ordering::Relaxed);
            n
        })
    }

    /// Format of `read_raw()` data: the source's rate and channel count.
    pub fn raw_format(&self) -> AudioFormat {
        *self.shared.raw_format.lock()
    }

    /// Format of `read()` data: always mono at the processed rate.
    pub fn processed_format(&self) -> AudioFormat {
        self.shared.config.processed_format()
    }

    // ── Voice activity ───────────────────────────────────────────────────────

    /// Lock-free: reads the flag mirrored by the capture path.
    pub fn voice_detected(&self) -> bool {
        self.shared.voice_active.load(Ordering::Relaxed)
    }

    /// Full detector snapshot. If the capture path holds the detector past
    /// the process lock timeout, only `is_active` is filled in.
    pub fn voice_activity(&self) -> VoiceActivity {
        let timeout = Duration::from_millis(self.shared.config.process_lock_timeout_ms);
        match self.shared.vad.try_lock_for(timeout) {
            Some(vad) => vad.activity(),
            None => {
                self.shared.lock_miss("voice_activity");
                VoiceActivity {
                    is_active: self.voice_detected(),
                    ..VoiceActivity::default()
                }
            }
        }
    }

    // ── Output control ───────────────────────────────────────────────────────

    /// Set playback volume in percent; values above 100 clamp to 100.
    pub fn set_volume(&self, volume: u8) {
        let volume = volume.min(100);
        self.shared.volume.store(volume, Ordering::Relaxed);
        info!(volume, "volume set");
    }

    pub fn volume(&self) -> u8 {
        self.shared.volume.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
        info!(muted, "mute set");
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    // ── Observability ────────────────────────────────────────────────────────

    /// Output and processed-input fill levels as of the last ring access.
    /// Both 0 before `init()`. Never blocks.
    pub fn buffer_levels(&self) -> BufferLevels {
        BufferLevels {
            output_pct: self.shared.output_level.load(Ordering::Relaxed),
            input_pct: self.shared.input_level.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.diagnostics.snapshot()
    }

    /// Current pipeline state (snapshot).
    pub fn state(&self) -> PipelineState {
        *self.shared.state.lock()
    }

    /// Subscribe to voice activity edges.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<VoiceActivityEvent> {
        self.shared.activity_tx.subscribe()
    }

    /// Subscribe to state change events.
    pub fn subscribe_state(&self) -> broadcast::Receiver<PipelineStateEvent> {
        self.shared.state_tx.subscribe()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Apply a control transition. `next` gets the current state and whether
    /// it is a `Duplex` pause, and returns `None` for a no-op.
    fn transition(
        &self,
        operation: &'static str,
        next: impl FnOnce(PipelineState, bool) -> Option<PipelineState>,
    ) -> Result<()> {
        let changed = {
            let mut state = self.shared.state.lock();
            match *state {
                PipelineState::Uninitialized => return Err(AudioError::NotInitialized),
                PipelineState::Error => {
                    return Err(AudioError::InvalidState {
                        operation,
                        state: PipelineState::Error,
                    })
                }
                current => {
                    let paused_from_duplex = self.shared.paused_from_duplex.load(Ordering::Relaxed);
                    match next(current, paused_from_duplex) {
                        Some(new_state) if new_state != current => {
                            // Only written under the state lock.
                            self.shared.paused_from_duplex.store(
                                current == PipelineState::Duplex
                                    && new_state == PipelineState::Recording,
                                Ordering::Relaxed,
                            );
                            *state = new_state;
                            Some(new_state)
                        }
                        _ => None,
                    }
                }
            }
        };

        if let Some(new_state) = changed {
            self.shared.publish_state(new_state, None);
        }
        Ok(())
    }
}

impl std::fmt::Debug for AudioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPipeline")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
