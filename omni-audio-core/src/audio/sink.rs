//! DAC sinks: where `process()` sends volume-scaled playback chunks.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, warn};

use crate::buffering::pcm::{samples_from_le_bytes, AudioFormat};
use crate::error::{AudioError, Result};

/// Output hardware channel.
pub trait DacSink: Send + 'static {
    /// Configure and enable the channel. A failure here fails `init()`.
    fn enable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write one chunk, waiting at most `timeout`. Returns bytes accepted.
    ///
    /// Errors are logged by the caller and the chunk is lost.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Release the channel. Called from `deinit()`.
    fn disable(&mut self) {}
}

impl DacSink for Box<dyn DacSink> {
    fn enable(&mut self) -> Result<()> {
        (**self).enable()
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        (**self).write(data, timeout)
    }

    fn disable(&mut self) {
        (**self).disable()
    }
}

/// Discards everything. Used when no output device is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DacSink for NullSink {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        Ok(data.len())
    }
}

/// Records the DAC stream to a 16-bit PCM WAV file.
pub struct WavSink {
    path: PathBuf,
    format: AudioFormat,
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavSink {
    /// Prepare a sink that will create `path` on `enable()`.
    pub fn new(path: impl Into<PathBuf>, format: AudioFormat) -> Self {
        Self {
            path: path.into(),
            format,
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DacSink for WavSink {
    fn enable(&mut self) -> Result<()> {
        let spec = WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        self.writer = Some(WavWriter::create(&self.path, spec)?);
        info!(
            path = %self.path.display(),
            sample_rate = self.format.sample_rate,
            channels = self.format.channels,
            "WAV DAC sink enabled"
        );
        Ok(())
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            AudioError::AudioStream("WAV sink written before enable()".into())
        })?;
        for sample in samples_from_le_bytes(data) {
            writer.write_sample(sample)?;
        }
        Ok(data.len() & !1)
    }

    fn disable(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finalize() {
                Ok(()) => info!(path = %self.path.display(), "WAV DAC sink finalized"),
                Err(e) => warn!(path = %self.path.display(), "failed to finalize WAV sink: {e}"),
            }
        }
    }
}
