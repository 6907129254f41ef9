//! omni-audio host service entry point.
//!
//! ## Runtime note
//!
//! The pipeline API blocks for a few milliseconds at most, but it does
//! block, so the service loop (`process()`, playback feed, capture drain)
//! runs under `spawn_blocking`. The async side only waits on events and
//! Ctrl-C.

mod settings;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use omni_audio_core::{
    buffering::pcm::{samples_from_le_bytes, samples_to_le_bytes},
    list_input_devices, AudioFormat, AudioPipeline, DacSink, DeviceCapture, NullSink,
    SampleSource, UsbMic, UsbMicConfig, WavFileMic, WavSink,
};
use settings::{load_settings, resolve_settings_path, save_settings, AppSettings, INPUT_KIND_WAV};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Bounded wait used for the service loop's own ring accesses.
const SERVICE_LOCK_TIMEOUT_MS: u64 = 5;
const USB_EVENT_CAPACITY: usize = 256;

type Recorder = WavWriter<BufWriter<File>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("omni_audio=info,omni_audio_core=info")
            }),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--list-devices") {
        for device in list_input_devices() {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("{}{marker}", device.name);
        }
        return Ok(());
    }

    let settings_path = resolve_settings_path(&args);
    let mut settings = load_settings(&settings_path);
    if !settings_path.exists() {
        match save_settings(&settings_path, &settings) {
            Ok(()) => info!(path = %settings_path.display(), "wrote default settings"),
            Err(e) => warn!(path = %settings_path.display(), "failed to write default settings: {e}"),
        }
    }
    settings.apply_env_overrides();
    settings.normalize();
    info!(
        path = %settings_path.display(),
        input = %settings.input_kind,
        interval_ms = settings.process_interval_ms,
        "omni-audio starting"
    );

    let pipeline = AudioPipeline::new(settings.pipeline.clone());

    let sink: Box<dyn DacSink> = match &settings.output_wav {
        Some(path) => {
            let sink = WavSink::new(path, settings.pipeline.output_format());
            info!(path = %sink.path().display(), "DAC output goes to WAV file");
            Box::new(sink)
        }
        None => Box::new(NullSink),
    };

    // Host capture must outlive the service loop; dropping it disconnects.
    let (source, capture) = open_source(&settings)?;
    pipeline.init(source, sink).context("audio pipeline init failed")?;

    if let Err(e) = pipeline.wait_ready(settings.ready_timeout_ms) {
        warn!(error = %e, "microphone not ready yet; continuing");
    }

    let playback = match &settings.playback_wav {
        Some(path) => {
            let bytes = load_playback(path, settings.pipeline.output_format())?;
            pipeline.play()?;
            bytes
        }
        None => Vec::new(),
    };

    let recorder = match &settings.record_wav {
        Some(path) => Some(create_recorder(path, pipeline.processed_format())?),
        None => None,
    };
    pipeline.record_start()?;

    let running = Arc::new(AtomicBool::new(true));
    let service = tokio::task::spawn_blocking({
        let pipeline = pipeline.clone();
        let running = Arc::clone(&running);
        let interval = Duration::from_millis(settings.process_interval_ms);
        move || run_service_loop(pipeline, running, interval, playback, recorder)
    });

    let mut activity = pipeline.subscribe_activity();
    let mut states = pipeline.subscribe_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown requested");
                break;
            }
            event = activity.recv() => match event {
                Ok(ev) if ev.is_active => info!(
                    energy_db = format_args!("{:.1}", ev.energy_db),
                    "voice detected"
                ),
                Ok(ev) => info!(duration_ms = ev.duration_ms, "voice ended"),
                Err(RecvError::Lagged(n)) => warn!(missed = n, "activity events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = states.recv() => match event {
                Ok(ev) => info!(state = ?ev.state, detail = ?ev.detail, "pipeline state"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    running.store(false, Ordering::SeqCst);
    let recorded = service.await.context("service loop panicked")??;
    drop(capture);

    let stats = pipeline.stats();
    let levels = pipeline.buffer_levels();
    pipeline.deinit();
    info!(
        recorded_bytes = recorded,
        underruns = stats.underruns,
        overruns = stats.overruns,
        raw_overruns = stats.raw_overruns,
        lock_misses = stats.lock_misses,
        output_pct = levels.output_pct,
        input_pct = levels.input_pct,
        "omni-audio stopped"
    );
    Ok(())
}

/// Build the configured sample source. The returned capture handle, if any,
/// must be kept alive for as long as the pipeline runs.
fn open_source(settings: &AppSettings) -> anyhow::Result<(SampleSource, Option<DeviceCapture>)> {
    if settings.input_kind == INPUT_KIND_WAV {
        let Some(path) = settings.input_wav.as_deref() else {
            bail!("inputKind is \"wav\" but inputWav is not set");
        };
        let mic = WavFileMic::open(path, settings.realtime_input)
            .with_context(|| format!("failed to open input WAV {}", path.display()))?;
        return Ok((SampleSource::I2sMic(mic.into_i2s_mic()), None));
    }

    let (tx, mut mic) = UsbMic::channel(settings.usb_mic, USB_EVENT_CAPACITY);
    let capture = DeviceCapture::open(
        tx,
        Arc::new(AtomicBool::new(true)),
        settings.preferred_input_device.as_deref(),
        &settings.usb_mic,
    )
    .context("failed to open input device")?;

    // Interpret the stream in the format the device actually opened with.
    mic.config = UsbMicConfig {
        preferred_sample_rate: capture.info.sample_rate,
        preferred_channels: capture.info.channels,
    };
    Ok((SampleSource::UsbMic(mic), Some(capture)))
}

/// Periodic service: top up playback, drain to the DAC, drain capture.
///
/// Returns the number of processed bytes drained.
fn run_service_loop(
    pipeline: AudioPipeline,
    running: Arc<AtomicBool>,
    interval: Duration,
    playback: Vec<u8>,
    mut recorder: Option<Recorder>,
) -> anyhow::Result<u64> {
    let mut offset = 0usize;
    let mut drained = 0u64;
    let mut buf = vec![0u8; 4096];

    while running.load(Ordering::SeqCst) {
        if offset < playback.len() {
            offset += pipeline.write(&playback[offset..], SERVICE_LOCK_TIMEOUT_MS);
            if offset >= playback.len() {
                info!(bytes = playback.len(), "playback queued");
            }
        }

        pipeline.process();

        loop {
            let n = pipeline.read(&mut buf, SERVICE_LOCK_TIMEOUT_MS);
            if n == 0 {
                break;
            }
            drained += n as u64;
            if let Some(writer) = recorder.as_mut() {
                for sample in samples_from_le_bytes(&buf[..n]) {
                    writer.write_sample(sample)?;
                }
            }
        }

        // Raw feed is only needed by callers that ask for it.
        while pipeline.read_raw(&mut buf, SERVICE_LOCK_TIMEOUT_MS) == buf.len() {}

        std::thread::sleep(interval);
    }

    if let Some(writer) = recorder {
        writer.finalize()?;
    }
    Ok(drained)
}

fn load_playback(path: &Path, expected: AudioFormat) -> anyhow::Result<Vec<u8>> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open playback WAV {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!("playback WAV {} is not 16-bit PCM", path.display());
    }
    if spec.sample_rate != expected.sample_rate || spec.channels != expected.channels {
        warn!(
            file_rate = spec.sample_rate,
            file_channels = spec.channels,
            dac_rate = expected.sample_rate,
            dac_channels = expected.channels,
            "playback WAV format differs from DAC format; playing as-is"
        );
    }
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("failed to decode playback WAV")?;
    Ok(samples_to_le_bytes(&samples))
}

fn create_recorder(path: &Path, format: AudioFormat) -> anyhow::Result<Recorder> {
    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bit_depth,
        sample_format: SampleFormat::Int,
    };
    WavWriter::create(path, spec)
        .with_context(|| format!("failed to create recording {}", path.display()))
}
