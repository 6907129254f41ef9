//! Microphone sources, DAC sinks and the host capture adapter.
//!
//! # Host capture
//!
//! `DeviceCapture` plays the role of the USB microphone on a development
//! host: a cpal input stream pushes interleaved 16-bit PCM into a
//! `SourceEvent` channel drained by the pipeline.
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block, so chunks are handed over with `try_send` and dropped
//! (with a warning) when the pipeline falls behind.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `DeviceCapture` must be created and dropped on the same thread.

pub mod device;
pub mod downsample;
pub mod sink;
pub mod source;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use crossbeam_channel::Sender;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::info;
#[cfg(feature = "audio-cpal")]
use tracing::{error, warn};

use crate::{
    audio::{
        device::UsbDeviceInfo,
        source::{SourceEvent, UsbMicConfig},
    },
    error::{AudioError, Result},
};

/// Handle to an active host capture stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Dropping it stops the stream and reports `SourceEvent::Disconnected`.
pub struct DeviceCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag; set to `false` to make the callback no-op.
    running: Arc<AtomicBool>,
    events: Sender<SourceEvent>,
    /// Format and identity reported in the `Connected` event.
    pub info: UsbDeviceInfo,
}

#[cfg(feature = "audio-cpal")]
fn to_le_bytes_i16(data: &[i16], out: &mut Vec<u8>) {
    out.clear();
    for s in data {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

#[cfg(feature = "audio-cpal")]
fn to_le_bytes_f32(data: &[f32], out: &mut Vec<u8>) {
    out.clear();
    for s in data {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
}

#[cfg(feature = "audio-cpal")]
fn forward(events: &Sender<SourceEvent>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    if events.try_send(SourceEvent::Data(bytes.to_vec())).is_err() {
        warn!(bytes = bytes.len(), "capture channel full: dropped chunk");
    }
}

impl DeviceCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    ///
    /// The stream is requested at `config.preferred_sample_rate` with at
    /// most `config.preferred_channels` channels. A `Connected` event is
    /// sent before the stream starts.
    ///
    /// # Errors
    /// `NoDefaultInputDevice` when no microphone exists, `AudioDevice` /
    /// `AudioStream` when cpal rejects the device or the requested format.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        events: Sender<SourceEvent>,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
        config: &UsbMicConfig,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });

                    if selected_device.is_none() {
                        warn!(
                            "preferred input device '{}' not found, falling back",
                            preferred_name
                        );
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| AudioError::AudioDevice(e.to_string()))?;
            let fallback = devices.next().ok_or(AudioError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        let device_name = device.name().unwrap_or_default();
        info!(device = device_name.as_str(), "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::AudioDevice(e.to_string()))?;

        let channels = supported.channels().min(config.preferred_channels).max(1);
        let sample_rate = config.preferred_sample_rate;

        info!(sample_rate, channels, "capture format requested");

        let stream_config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running_i16 = Arc::clone(&running);
        let running_f32 = Arc::clone(&running);
        let events_i16 = events.clone();
        let events_f32 = events.clone();

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                let mut bytes: Vec<u8> = Vec::new();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        to_le_bytes_i16(data, &mut bytes);
                        forward(&events_i16, &bytes);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            SampleFormat::F32 => {
                let mut bytes: Vec<u8> = Vec::new();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        to_le_bytes_f32(data, &mut bytes);
                        forward(&events_f32, &bytes);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(AudioError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| AudioError::AudioStream(e.to_string()))?;

        let info = UsbDeviceInfo {
            vid: 0,
            pid: 0,
            sample_rate,
            channels,
            bit_depth: 16,
            name: Some(device_name),
        };
        events
            .send(SourceEvent::Connected(info.clone()))
            .map_err(|_| AudioError::AudioStream("capture event channel closed".into()))?;

        stream
            .play()
            .map_err(|e| AudioError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            events,
            info,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl DeviceCapture {
    pub fn open(
        _events: Sender<SourceEvent>,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
        _config: &UsbMicConfig,
    ) -> Result<Self> {
        Err(AudioError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.events.try_send(SourceEvent::Disconnected);
        info!("host capture closed");
    }
}
