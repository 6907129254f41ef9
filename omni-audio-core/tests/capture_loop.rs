use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavSpec, WavWriter};
use omni_audio_core::audio::downsample::{decimate, ChannelLayout, FilterState};
use omni_audio_core::buffering::pcm::{samples_from_le_bytes, samples_to_le_bytes};
use omni_audio_core::{
    AudioError, AudioPipeline, I2sMic, I2sMicConfig, MicReader, NullSink, PipelineConfig,
    PipelineState, SampleSource, SourceEvent, UsbDeviceInfo, UsbMic, UsbMicConfig,
    VoiceActivityEvent, WavFileMic,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Plays back a fixed list of reads, then idles.
struct ScriptedMic {
    script: VecDeque<Result<Vec<u8>, AudioError>>,
    dropped: Arc<AtomicBool>,
}

impl ScriptedMic {
    fn new(script: Vec<Result<Vec<u8>, AudioError>>) -> Self {
        Self {
            script: script.into(),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MicReader for ScriptedMic {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> omni_audio_core::Result<usize> {
        match self.script.pop_front() {
            Some(Ok(bytes)) => {
                assert!(bytes.len() <= buf.len(), "scripted read exceeds buffer");
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(Err(e)) => Err(e),
            None => {
                thread::sleep(timeout);
                Ok(0)
            }
        }
    }
}

impl Drop for ScriptedMic {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        capture_read_timeout_ms: 5,
        capture_error_backoff_ms: 1,
        ..PipelineConfig::default()
    }
}

fn sine_1khz(frames: usize) -> Vec<i16> {
    (0..frames)
        .map(|i| (32767.0 * (2.0 * PI * 1000.0 * i as f32 / 48_000.0).sin()) as i16)
        .collect()
}

/// Poll `read` until `want` bytes arrived or `timeout` passed.
fn drain(
    mut read: impl FnMut(&mut [u8]) -> usize,
    want: usize,
    timeout: Duration,
) -> Vec<u8> {
    let start = Instant::now();
    let mut collected = Vec::new();
    let mut buf = vec![0u8; 4096];
    while collected.len() < want {
        let n = read(&mut buf);
        collected.extend_from_slice(&buf[..n]);
        if n == 0 {
            if start.elapsed() >= timeout {
                panic!(
                    "timed out after {} of {want} bytes",
                    collected.len()
                );
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
    collected
}

fn recv_activity_with_timeout(
    rx: &mut broadcast::Receiver<VoiceActivityEvent>,
    timeout: Duration,
) -> VoiceActivityEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for activity event");
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("activity channel closed unexpectedly"),
        }
    }
}

#[test]
fn uneven_reads_decimate_like_one_stream() {
    let input = sine_1khz(480);
    let mut script = Vec::new();
    let mut offset = 0;
    for frames in [100, 7, 233, 1, 139] {
        script.push(Ok(samples_to_le_bytes(&input[offset..offset + frames])));
        offset += frames;
    }
    assert_eq!(offset, input.len());

    let pipeline = AudioPipeline::new(fast_config());
    pipeline
        .init(
            SampleSource::I2sMic(I2sMic::new(I2sMicConfig::default(), ScriptedMic::new(script))),
            NullSink,
        )
        .unwrap();

    let processed = drain(|buf| pipeline.read(buf, 10), 320, Duration::from_secs(2));
    let expected = decimate(&input, ChannelLayout::Mono, &mut FilterState::new(3));
    assert_eq!(expected.len(), 160);
    assert_eq!(samples_from_le_bytes(&processed), expected);

    let raw = drain(|buf| pipeline.read_raw(buf, 10), 960, Duration::from_secs(2));
    assert_eq!(samples_from_le_bytes(&raw), input);
    assert!(pipeline.voice_detected());

    pipeline.deinit();
}

#[test]
fn read_errors_do_not_stop_capture() {
    let script = vec![
        Err(AudioError::AudioStream("I2S DMA timeout".into())),
        Err(AudioError::AudioStream("I2S DMA timeout".into())),
        Ok(vec![0u8; 480]),
    ];
    let pipeline = AudioPipeline::new(fast_config());
    pipeline
        .init(
            SampleSource::I2sMic(I2sMic::new(I2sMicConfig::default(), ScriptedMic::new(script))),
            NullSink,
        )
        .unwrap();

    let raw = drain(|buf| pipeline.read_raw(buf, 10), 480, Duration::from_secs(2));
    assert_eq!(raw.len(), 480);
    assert_eq!(pipeline.state(), PipelineState::Idle);
    pipeline.deinit();
}

#[test]
fn usb_events_drive_capture_and_readiness() {
    let pipeline = AudioPipeline::new(fast_config());
    let mut activity = pipeline.subscribe_activity();
    let (tx, mic) = UsbMic::channel(UsbMicConfig::default(), 16);
    pipeline.init(SampleSource::UsbMic(mic), NullSink).unwrap();
    assert!(!pipeline.mic_connected());

    tx.send(SourceEvent::Connected(UsbDeviceInfo {
        vid: 0x2886,
        pid: 0x0018,
        sample_rate: 48_000,
        channels: 2,
        bit_depth: 16,
        name: None,
    }))
    .unwrap();
    pipeline.wait_ready(1000).unwrap();

    // Same tone on both channels: the mix is the tone itself.
    let tone = sine_1khz(240);
    let stereo: Vec<i16> = tone.iter().flat_map(|&s| [s, s]).collect();
    tx.send(SourceEvent::Data(samples_to_le_bytes(&stereo))).unwrap();

    let event = recv_activity_with_timeout(&mut activity, Duration::from_secs(2));
    assert!(event.is_active);

    let processed = drain(|buf| pipeline.read(buf, 10), 160, Duration::from_secs(2));
    let expected: Vec<i16> = tone.iter().skip(2).step_by(3).copied().collect();
    assert_eq!(samples_from_le_bytes(&processed), expected);

    tx.send(SourceEvent::Disconnected).unwrap();
    let deadline = Instant::now() + Duration::from_secs(1);
    while pipeline.mic_connected() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert!(!pipeline.mic_connected());
    assert!(pipeline.wait_ready(10).is_err());

    pipeline.deinit();
}

#[test]
fn dropping_last_handle_stops_capture_thread() {
    let mic = ScriptedMic::new(Vec::new());
    let dropped = Arc::clone(&mic.dropped);

    let pipeline = AudioPipeline::new(fast_config());
    pipeline
        .init(SampleSource::I2sMic(I2sMic::new(I2sMicConfig::default(), mic)), NullSink)
        .unwrap();
    drop(pipeline);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !dropped.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert!(dropped.load(Ordering::SeqCst), "capture thread still owns the reader");
}

#[test]
fn wav_file_mic_feeds_raw_ring_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mic.wav");
    let samples = sine_1khz(1200);
    {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for &s in &samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    let mic = WavFileMic::open(&path, false).unwrap();
    let pipeline = AudioPipeline::new(fast_config());
    pipeline
        .init(SampleSource::I2sMic(mic.into_i2s_mic()), NullSink)
        .unwrap();

    let raw = drain(|buf| pipeline.read_raw(buf, 10), 2400, Duration::from_secs(2));
    assert_eq!(samples_from_le_bytes(&raw), samples);

    let processed = drain(|buf| pipeline.read(buf, 10), 800, Duration::from_secs(2));
    assert_eq!(processed.len(), 800);
    pipeline.deinit();
}
