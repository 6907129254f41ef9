//! Shared pipeline state, the capture path and the DAC drain.
//!
//! ## Locks
//!
//! ```text
//! input  : raw ring + processed ring + downsampler        (capture ↔ readers)
//! output : output ring                                     (writer ↔ DAC drain)
//! vad    : detector state                                  (capture ↔ UI)
//! sink   : DAC channel + chunk scratch                     (DAC drain only)
//! ```
//!
//! Nesting order is `input → vad` and `sink → output`; nothing nests the
//! other way round. The decimation phase and the processed append share one
//! critical section, so chunk boundaries seen downstream always match the
//! phase. Capture and DAC drain never contend with each other.
//!
//! Every streaming lock wait is bounded. A miss drops the chunk (capture),
//! skips the cycle (`process`) or moves zero bytes (`read` / `write`), and
//! goes through [`Shared::lock_miss`]. Fill levels and the voice flag are
//! mirrored into atomics so status queries never wait on a lock.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        device::UsbDeviceInfo,
        downsample::Downsampler,
        sink::DacSink,
        source::{MicReader, SourceEvent},
    },
    buffering::{
        pcm::{samples_from_le_bytes_into, samples_to_le_bytes_into, AudioFormat},
        ByteRing,
    },
    engine::PipelineConfig,
    error::Result,
    ipc::events::{PipelineState, PipelineStateEvent, PipelineStats, VoiceActivityEvent},
    vad::{VadTransition, VoiceActivityDetector},
};

/// Capacity and contention counters, readable without any lock.
#[derive(Default)]
pub struct PipelineDiagnostics {
    pub underruns: AtomicU32,
    pub overruns: AtomicU32,
    pub raw_overruns: AtomicU32,
    pub lock_misses: AtomicU32,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.underruns.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.raw_overruns.store(0, Ordering::Relaxed);
        self.lock_misses.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            raw_overruns: self.raw_overruns.load(Ordering::Relaxed),
            lock_misses: self.lock_misses.load(Ordering::Relaxed),
        }
    }
}

/// Everything the capture path mutates under the input lock.
pub(crate) struct InputStage {
    pub raw: ByteRing,
    pub processed: ByteRing,
    pub downsampler: Downsampler,
    samples: Vec<i16>,
    mono: Vec<i16>,
    mono_bytes: Vec<u8>,
}

impl InputStage {
    pub fn new(raw: ByteRing, processed: ByteRing, downsampler: Downsampler) -> Self {
        Self {
            raw,
            processed,
            downsampler,
            samples: Vec::new(),
            mono: Vec::new(),
            mono_bytes: Vec::new(),
        }
    }
}

/// The DAC plus the buffer each drain cycle reads into.
pub(crate) struct SinkStage {
    pub sink: Box<dyn DacSink>,
    chunk: Vec<u8>,
}

impl SinkStage {
    pub fn new(sink: Box<dyn DacSink>, chunk_bytes: usize) -> Self {
        Self {
            sink,
            chunk: vec![0u8; chunk_bytes],
        }
    }
}

/// State shared by every `AudioPipeline` clone and the capture thread.
pub(crate) struct Shared {
    pub config: PipelineConfig,
    /// Serialises `init` / `deinit`.
    pub lifecycle: Mutex<()>,
    pub initialized: AtomicBool,
    pub state: Mutex<PipelineState>,
    pub ready: Mutex<bool>,
    pub ready_cv: Condvar,
    /// Microphone connected and streaming.
    pub mic_ready: AtomicBool,
    pub input: Mutex<Option<InputStage>>,
    pub output: Mutex<Option<ByteRing>>,
    pub sink: Mutex<Option<SinkStage>>,
    pub vad: Mutex<Box<dyn VoiceActivityDetector>>,
    /// Mirror of the detector's `is_active`, written under the vad lock.
    pub voice_active: AtomicBool,
    /// Output ring fill, written by whoever holds the output lock.
    pub output_level: AtomicU8,
    /// Processed ring fill, written by whoever holds the input lock.
    pub input_level: AtomicU8,
    /// Set when `pause` demoted `Duplex` to `Recording`.
    pub paused_from_duplex: AtomicBool,
    pub raw_format: Mutex<AudioFormat>,
    pub volume: AtomicU8,
    pub muted: AtomicBool,
    pub diagnostics: PipelineDiagnostics,
    pub capture_running: Arc<AtomicBool>,
    pub capture_thread: Mutex<Option<JoinHandle<()>>>,
    pub activity_seq: AtomicU64,
    pub activity_tx: broadcast::Sender<VoiceActivityEvent>,
    pub state_tx: broadcast::Sender<PipelineStateEvent>,
}

impl Shared {
    pub fn set_state(&self, new_state: PipelineState, detail: Option<String>) {
        *self.state.lock() = new_state;
        self.publish_state(new_state, detail);
    }

    pub fn publish_state(&self, state: PipelineState, detail: Option<String>) {
        info!(state = ?state, "audio pipeline state changed");
        let _ = self.state_tx.send(PipelineStateEvent { state, detail });
    }

    pub fn set_ready(&self, ready: bool) {
        *self.ready.lock() = ready;
        self.ready_cv.notify_all();
    }

    pub fn lock_miss(&self, operation: &'static str) {
        let misses = self.diagnostics.lock_misses.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(operation, lock_misses = misses, "bounded lock wait timed out");
    }

    /// Route one capture chunk into the raw and processed feeds, then the VAD.
    pub fn process_mic_data(&self, data: &[u8]) {
        if !self.initialized.load(Ordering::Acquire) || data.is_empty() {
            return;
        }

        let timeout = Duration::from_millis(self.config.capture_lock_timeout_ms);
        let Some(mut guard) = self.input.try_lock_for(timeout) else {
            self.lock_miss("capture");
            return;
        };
        let Some(stage) = guard.as_mut() else {
            return;
        };

        if !stage.raw.write_all_or_nothing(data) {
            let n = self.diagnostics.raw_overruns.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(bytes = data.len(), raw_overruns = n, "raw ring full: dropped chunk");
        }

        let InputStage {
            processed,
            downsampler,
            samples,
            mono,
            mono_bytes,
            ..
        } = stage;

        // Phase advances even if the append below is dropped.
        samples_from_le_bytes_into(data, samples);
        if downsampler.process_into(&samples[..], mono) == 0 {
            return;
        }

        samples_to_le_bytes_into(&mono[..], mono_bytes);
        if !processed.write_all_or_nothing(&mono_bytes[..]) {
            let n = self.diagnostics.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(samples = mono.len(), overruns = n, "processed ring full: dropped chunk");
        }
        self.input_level
            .store(processed.fill_percent(), Ordering::Relaxed);

        self.update_vad(&mono[..], Instant::now());
    }

    pub fn update_vad(&self, mono: &[i16], now: Instant) {
        let (transition, activity) = {
            let mut vad = self.vad.lock();
            let transition = vad.update(mono, now);
            let activity = vad.activity();
            self.voice_active
                .store(activity.is_active, Ordering::Relaxed);
            (transition, activity)
        };

        if transition == VadTransition::Unchanged {
            return;
        }

        let seq = self.activity_seq.fetch_add(1, Ordering::Relaxed);
        debug!(
            seq,
            is_active = activity.is_active,
            energy_db = format_args!("{:.1}", activity.energy_db),
            duration_ms = activity.duration_ms,
            "voice activity edge"
        );
        let _ = self.activity_tx.send(VoiceActivityEvent {
            seq,
            is_active: activity.is_active,
            energy_db: activity.energy_db,
            duration_ms: activity.duration_ms,
        });
    }

    /// Drain one chunk from the output ring to the DAC.
    pub fn process_output(&self) {
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }

        let lock_timeout = Duration::from_millis(self.config.process_lock_timeout_ms);
        let Some(state) = self.state.try_lock_for(lock_timeout).map(|state| *state) else {
            self.lock_miss("process");
            return;
        };
        if !state.is_playing() {
            return;
        }

        let Some(mut sink_guard) = self.sink.try_lock_for(lock_timeout) else {
            self.lock_miss("dac");
            return;
        };
        let Some(stage) = sink_guard.as_mut() else {
            return;
        };
        let chunk_len = stage.chunk.len();

        {
            let Some(mut guard) = self.output.try_lock_for(lock_timeout) else {
                self.lock_miss("process");
                return;
            };
            let Some(ring) = guard.as_mut() else {
                return;
            };
            if ring.available() < chunk_len {
                drop(guard);
                let n = self.diagnostics.underruns.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(underruns = n, "output ring underrun");
                return;
            }
            ring.read(&mut stage.chunk);
            self.output_level
                .store(ring.fill_percent(), Ordering::Relaxed);
        }

        apply_volume(
            &mut stage.chunk,
            self.volume.load(Ordering::Relaxed),
            self.muted.load(Ordering::Relaxed),
        );

        let write_timeout = Duration::from_millis(self.config.sink_write_timeout_ms);
        match stage.sink.write(&stage.chunk, write_timeout) {
            Ok(n) if n < chunk_len => {
                debug!(written = n, requested = chunk_len, "short DAC write")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "DAC write failed"),
        }
    }

    pub fn on_mic_connected(&self, info: &UsbDeviceInfo) {
        info!(
            vid = format_args!("0x{:04X}", info.vid),
            pid = format_args!("0x{:04X}", info.pid),
            name = info.name.as_deref().unwrap_or("unknown"),
            sample_rate = info.sample_rate,
            channels = info.channels,
            bit_depth = info.bit_depth,
            "USB microphone connected"
        );
        if info.is_respeaker() {
            info!("ReSpeaker USB Mic Array detected: beamforming enabled");
        }

        let expected = *self.raw_format.lock();
        if info.sample_rate != expected.sample_rate
            || info.channels != expected.channels
            || info.bit_depth != expected.bit_depth
        {
            warn!(
                reported_rate = info.sample_rate,
                reported_channels = info.channels,
                expected_rate = expected.sample_rate,
                expected_channels = expected.channels,
                "microphone format differs from configured format; data is interpreted as configured"
            );
        }

        self.mic_ready.store(true, Ordering::Release);
        self.set_ready(true);
    }

    pub fn on_mic_disconnected(&self) {
        warn!("USB microphone disconnected");
        self.mic_ready.store(false, Ordering::Release);
        self.set_ready(false);
    }

    /// Stop the capture thread and release every stage.
    pub fn tear_down(&self) {
        self.capture_running.store(false, Ordering::Release);
        let handle = self.capture_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("capture thread panicked");
            }
        }

        let sink = self.sink.lock().take();
        if let Some(mut stage) = sink {
            stage.sink.disable();
        }
        *self.input.lock() = None;
        *self.output.lock() = None;
        self.input_level.store(0, Ordering::Relaxed);
        self.output_level.store(0, Ordering::Relaxed);

        self.initialized.store(false, Ordering::Release);
        self.mic_ready.store(false, Ordering::Release);
        self.set_ready(false);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Lets a detached capture thread exit once every handle is gone.
        self.capture_running.store(false, Ordering::Release);
    }
}

/// Scale 16-bit little-endian samples by `volume` percent, or zero-fill.
///
/// Scaling is `(sample * volume / 100.0) as i16`: a float multiply truncated
/// toward zero.
pub fn apply_volume(chunk: &mut [u8], volume: u8, muted: bool) {
    if muted {
        chunk.fill(0);
        return;
    }
    if volume >= 100 {
        return;
    }
    let scale = volume as f32 / 100.0;
    for frame in chunk.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([frame[0], frame[1]]);
        let scaled = (sample as f32 * scale) as i16;
        frame.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Capture-loop timing, copied out of the config for the thread.
pub(crate) struct CaptureTiming {
    pub read_timeout: Duration,
    pub error_backoff: Duration,
}

impl CaptureTiming {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(config.capture_read_timeout_ms),
            error_backoff: Duration::from_millis(config.capture_error_backoff_ms),
        }
    }
}

/// Start the blocking-read loop for an I2S-style microphone.
pub(crate) fn spawn_i2s_capture(
    shared: &Arc<Shared>,
    reader: Box<dyn MicReader>,
    read_bytes: usize,
) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(shared);
    let running = Arc::clone(&shared.capture_running);
    let timing = CaptureTiming::from_config(&shared.config);
    let handle = thread::Builder::new()
        .name("mic_capture".into())
        .spawn(move || run_i2s_capture(weak, running, reader, read_bytes, timing))?;
    Ok(handle)
}

fn run_i2s_capture(
    shared: Weak<Shared>,
    running: Arc<AtomicBool>,
    mut reader: Box<dyn MicReader>,
    read_bytes: usize,
    timing: CaptureTiming,
) {
    info!(read_bytes, "microphone capture started (i2s)");
    let mut rx = vec![0u8; read_bytes];

    while running.load(Ordering::Acquire) {
        match reader.read(&mut rx, timing.read_timeout) {
            Ok(0) => {}
            Ok(n) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.process_mic_data(&rx[..n.min(rx.len())]);
            }
            Err(e) => {
                warn!(error = %e, "microphone read error");
                thread::sleep(timing.error_backoff);
            }
        }
    }

    info!("microphone capture stopped (i2s)");
}

/// Start the event pump for a USB-style microphone.
pub(crate) fn spawn_usb_pump(
    shared: &Arc<Shared>,
    events: Receiver<SourceEvent>,
) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(shared);
    let running = Arc::clone(&shared.capture_running);
    let poll = Duration::from_millis(shared.config.capture_read_timeout_ms);
    let handle = thread::Builder::new()
        .name("usb_audio_pump".into())
        .spawn(move || run_usb_pump(weak, running, events, poll))?;
    Ok(handle)
}

fn run_usb_pump(
    shared: Weak<Shared>,
    running: Arc<AtomicBool>,
    events: Receiver<SourceEvent>,
    poll: Duration,
) {
    info!("microphone capture started (usb), waiting for device connection");

    while running.load(Ordering::Acquire) {
        let event = match events.recv_timeout(poll) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("USB audio event channel closed");
                if let Some(shared) = shared.upgrade() {
                    if shared.mic_ready.load(Ordering::Acquire) {
                        shared.on_mic_disconnected();
                    }
                }
                break;
            }
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            SourceEvent::Connected(info) => shared.on_mic_connected(&info),
            SourceEvent::Data(bytes) => shared.process_mic_data(&bytes),
            SourceEvent::Disconnected => shared.on_mic_disconnected(),
        }
    }

    info!("microphone capture stopped (usb)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::pcm::{samples_from_le_bytes, samples_to_le_bytes};

    #[test]
    fn volume_scales_with_truncation() {
        let mut chunk = samples_to_le_bytes(&[1000, -1000, 1, 32767]);
        apply_volume(&mut chunk, 70, false);
        assert_eq!(samples_from_le_bytes(&chunk), vec![700, -700, 0, 22936]);
    }

    #[test]
    fn full_volume_is_identity() {
        let original = samples_to_le_bytes(&[123, -32768, 32767]);
        let mut chunk = original.clone();
        apply_volume(&mut chunk, 100, false);
        assert_eq!(chunk, original);
    }

    #[test]
    fn mute_zero_fills() {
        let mut chunk = samples_to_le_bytes(&[5, 6, 7]);
        apply_volume(&mut chunk, 100, true);
        assert!(chunk.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_volume_silences() {
        let mut chunk = samples_to_le_bytes(&[32767, -32768]);
        apply_volume(&mut chunk, 0, false);
        assert_eq!(samples_from_le_bytes(&chunk), vec![0, 0]);
    }

    #[test]
    fn diagnostics_reset_and_snapshot() {
        let diagnostics = PipelineDiagnostics::default();
        diagnostics.overruns.fetch_add(2, Ordering::Relaxed);
        diagnostics.lock_misses.fetch_add(1, Ordering::Relaxed);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.overruns, 2);
        assert_eq!(snap.lock_misses, 1);
        diagnostics.reset();
        assert_eq!(diagnostics.snapshot(), PipelineStats::default());
    }
}
