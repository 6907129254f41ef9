//! Sample Source Adapters.
//!
//! Both microphone paths deliver the same thing to the pipeline: interleaved
//! 16-bit little-endian PCM at a known rate and channel count.
//!
//! - **I2S** microphones are pulled: the pipeline owns a capture thread that
//!   calls `MicReader::read` in a loop.
//! - **USB** microphones push: the adapter owns a `Sender<SourceEvent>` and
//!   the pipeline drains the matching receiver. Adapter and pipeline
//!   lifecycles stay independent.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use hound::{SampleFormat, WavReader};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::device::UsbDeviceInfo;
use crate::buffering::pcm::{AudioFormat, BYTES_PER_SAMPLE};
use crate::error::{AudioError, Result};

/// Blocking reader over an I2S-style microphone.
pub trait MicReader: Send + 'static {
    /// Fill `buf` with up to `buf.len()` bytes of PCM.
    ///
    /// `Ok(0)` means the read timed out with no data. Errors are transient
    /// from the pipeline's point of view: the capture loop logs and retries.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// Notifications pushed by a USB-style adapter.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Connected(UsbDeviceInfo),
    Data(Vec<u8>),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct I2sMicConfig {
    pub sample_rate: u32,
    /// 1 for INMP441 / SPH0645, 2 for ICS-43434.
    pub channels: u16,
}

impl Default for I2sMicConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct UsbMicConfig {
    pub preferred_sample_rate: u32,
    pub preferred_channels: u16,
}

impl Default for UsbMicConfig {
    fn default() -> Self {
        // ReSpeaker USB Mic Array streams 48 kHz stereo.
        Self {
            preferred_sample_rate: 48_000,
            preferred_channels: 2,
        }
    }
}

/// Pull-model microphone.
pub struct I2sMic {
    pub config: I2sMicConfig,
    pub(crate) reader: Box<dyn MicReader>,
}

impl I2sMic {
    pub fn new<R: MicReader>(config: I2sMicConfig, reader: R) -> Self {
        Self {
            config,
            reader: Box::new(reader),
        }
    }
}

/// Push-model microphone.
pub struct UsbMic {
    pub config: UsbMicConfig,
    pub(crate) events: Receiver<SourceEvent>,
}

impl UsbMic {
    pub fn new(config: UsbMicConfig, events: Receiver<SourceEvent>) -> Self {
        Self { config, events }
    }

    /// Create a bounded event channel and the `UsbMic` that drains it.
    ///
    /// Hand the returned sender to the adapter (driver callback, host
    /// capture stream, test harness).
    pub fn channel(config: UsbMicConfig, capacity: usize) -> (Sender<SourceEvent>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (tx, Self::new(config, rx))
    }
}

/// The microphone the pipeline captures from.
pub enum SampleSource {
    I2sMic(I2sMic),
    UsbMic(UsbMic),
}

impl SampleSource {
    /// Format of the raw feed this source produces.
    pub fn format(&self) -> AudioFormat {
        match self {
            Self::I2sMic(mic) => AudioFormat::pcm16(mic.config.sample_rate, mic.config.channels),
            Self::UsbMic(mic) => AudioFormat::pcm16(
                mic.config.preferred_sample_rate,
                mic.config.preferred_channels,
            ),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::I2sMic(_) => "i2s",
            Self::UsbMic(_) => "usb",
        }
    }
}

impl std::fmt::Debug for SampleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleSource")
            .field("kind", &self.kind())
            .field("format", &self.format())
            .finish()
    }
}

/// `MicReader` over a 16-bit PCM WAV file.
///
/// After the last sample it behaves like an idle microphone: each read
/// sleeps for the timeout and returns `Ok(0)`.
pub struct WavFileMic {
    reader: WavReader<BufReader<File>>,
    format: AudioFormat,
    realtime: bool,
    exhausted: bool,
}

impl WavFileMic {
    /// Open `path`. With `realtime` set, each read sleeps for the audio
    /// duration it returned so the pipeline sees a live-rate stream.
    ///
    /// # Errors
    /// `AudioError::Wav` on I/O or header errors, `UnsupportedFormat` for
    /// anything other than 16-bit integer mono/stereo.
    pub fn open(path: &Path, realtime: bool) -> Result<Self> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}: {:?} {}-bit (expected 16-bit PCM)",
                path.display(),
                spec.sample_format,
                spec.bits_per_sample
            )));
        }
        if !(1..=2).contains(&spec.channels) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}: {} channels (expected 1 or 2)",
                path.display(),
                spec.channels
            )));
        }

        info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            "opened WAV microphone source"
        );

        Ok(Self {
            reader,
            format: AudioFormat::pcm16(spec.sample_rate, spec.channels),
            realtime,
            exhausted: false,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Wrap as an I2S-style source using the file's own format.
    pub fn into_i2s_mic(self) -> I2sMic {
        let config = I2sMicConfig {
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
        };
        I2sMic::new(config, self)
    }
}

impl MicReader for WavFileMic {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        // Whole frames only, so channels never shear across reads.
        let frame_bytes = self.format.frame_bytes();
        let max_samples = (buf.len() / frame_bytes) * self.format.channels as usize;

        let mut written = 0usize;
        for sample in self.reader.samples::<i16>().take(max_samples) {
            let bytes = sample?.to_le_bytes();
            buf[written..written + BYTES_PER_SAMPLE].copy_from_slice(&bytes);
            written += BYTES_PER_SAMPLE;
        }

        if written == 0 {
            if !self.exhausted {
                self.exhausted = true;
                info!("WAV microphone source exhausted");
            }
            std::thread::sleep(timeout);
            return Ok(0);
        }

        if self.realtime {
            let frames = written / frame_bytes;
            std::thread::sleep(Duration::from_secs_f64(
                frames as f64 / self.format.sample_rate as f64,
            ));
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, channels: u16, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn wav_mic_reads_whole_frames_then_idles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let samples: Vec<i16> = (0..10).collect();
        write_wav(&path, 2, &samples);

        let mut mic = WavFileMic::open(&path, false).unwrap();
        assert_eq!(mic.format(), AudioFormat::pcm16(48_000, 2));

        // 14 bytes fits 3 whole stereo frames (12 bytes).
        let mut buf = [0u8; 14];
        assert_eq!(mic.read(&mut buf, Duration::from_millis(1)).unwrap(), 12);
        assert_eq!(&buf[..4], &[0, 0, 1, 0]);

        let mut rest = [0u8; 64];
        assert_eq!(mic.read(&mut rest, Duration::from_millis(1)).unwrap(), 8);
        assert_eq!(mic.read(&mut rest, Duration::from_millis(1)).unwrap(), 0);
    }

    #[test]
    fn wav_mic_rejects_float_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(
            WavFileMic::open(&path, false),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn source_format_follows_config() {
        let (_tx, usb) = UsbMic::channel(UsbMicConfig::default(), 4);
        let source = SampleSource::UsbMic(usb);
        assert_eq!(source.format(), AudioFormat::pcm16(48_000, 2));
        assert_eq!(source.kind(), "usb");
    }
}
