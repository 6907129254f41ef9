//! Persistent service settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use omni_audio_core::{PipelineConfig, UsbMicConfig};
use serde::{Deserialize, Serialize};

pub const INPUT_KIND_WAV: &str = "wav";
pub const INPUT_KIND_DEVICE: &str = "device";

const MIN_PROCESS_INTERVAL_MS: u64 = 1;
const MAX_PROCESS_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub pipeline: PipelineConfig,
    /// `"wav"` (file read like an I2S mic) or `"device"` (host capture
    /// pushed like a USB mic).
    pub input_kind: String,
    pub input_wav: Option<PathBuf>,
    /// Pace the WAV input at its own sample rate.
    pub realtime_input: bool,
    pub preferred_input_device: Option<String>,
    pub usb_mic: UsbMicConfig,
    /// Played through `write()` once the pipeline is up.
    pub playback_wav: Option<PathBuf>,
    /// DAC stream destination. `None` discards playback.
    pub output_wav: Option<PathBuf>,
    /// Where the drained 16 kHz feed is recorded, if anywhere.
    pub record_wav: Option<PathBuf>,
    pub process_interval_ms: u64,
    pub ready_timeout_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            input_kind: INPUT_KIND_DEVICE.into(),
            input_wav: None,
            realtime_input: true,
            preferred_input_device: None,
            usb_mic: UsbMicConfig::default(),
            playback_wav: None,
            output_wav: None,
            record_wav: None,
            process_interval_ms: 5,
            ready_timeout_ms: 3000,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.input_kind = normalize_input_kind(&self.input_kind);
        self.preferred_input_device = self
            .preferred_input_device
            .take()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        for path in [
            &mut self.input_wav,
            &mut self.playback_wav,
            &mut self.output_wav,
            &mut self.record_wav,
        ] {
            if path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                *path = None;
            }
        }
        self.process_interval_ms = self
            .process_interval_ms
            .clamp(MIN_PROCESS_INTERVAL_MS, MAX_PROCESS_INTERVAL_MS);
        self.pipeline.default_volume = self.pipeline.default_volume.min(100);
    }

    /// Environment overrides for ad-hoc runs, applied before `normalize()`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = std::env::var("OMNI_AUDIO_PROCESS_INTERVAL_MS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
        {
            self.process_interval_ms = ms;
        }
        if let Ok(device) = std::env::var("OMNI_AUDIO_INPUT_DEVICE") {
            self.preferred_input_device = Some(device);
        }
    }
}

pub fn normalize_input_kind(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "wav" | "file" | "i2s" => INPUT_KIND_WAV.into(),
        _ => INPUT_KIND_DEVICE.into(),
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Omni-P4")
            .join("omni-audio")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("omni-audio")
            .join("settings.json")
    }
}

/// `--settings <path>`, then `OMNI_AUDIO_SETTINGS`, then the default path.
pub fn resolve_settings_path(args: &[String]) -> PathBuf {
    args.windows(2)
        .find(|pair| pair[0] == "--settings")
        .map(|pair| PathBuf::from(&pair[1]))
        .or_else(|| std::env::var_os("OMNI_AUDIO_SETTINGS").map(PathBuf::from))
        .unwrap_or_else(default_settings_path)
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
