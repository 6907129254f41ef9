//! Microphone identity and host input-device enumeration.

use serde::{Deserialize, Serialize};

/// ReSpeaker USB Mic Array v2.0 vendor id.
pub const RESPEAKER_VID: u16 = 0x2886;
/// ReSpeaker USB Mic Array v2.0 product id.
pub const RESPEAKER_PID: u16 = 0x0018;

/// What a USB-style adapter reports when a microphone connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Product name, when the transport exposes one.
    pub name: Option<String>,
}

impl UsbDeviceInfo {
    /// Whether this is a ReSpeaker array (on-device beamforming).
    pub fn is_respeaker(&self) -> bool {
        self.vid == RESPEAKER_VID && self.pid == RESPEAKER_PID
    }
}

/// Metadata about a host audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
}

/// List all available audio input devices on the host.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
/// The default device sorts first.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => {
            let mut list = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    InputDeviceInfo { name, is_default }
                })
                .collect::<Vec<_>>();
            list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            default_name
                .map(|name| {
                    vec![InputDeviceInfo {
                        name,
                        is_default: true,
                    }]
                })
                .unwrap_or_default()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vid: u16, pid: u16) -> UsbDeviceInfo {
        UsbDeviceInfo {
            vid,
            pid,
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
            name: None,
        }
    }

    #[test]
    fn recognises_respeaker_array() {
        assert!(info(0x2886, 0x0018).is_respeaker());
        assert!(!info(0x2886, 0x0019).is_respeaker());
        assert!(!info(0x046d, 0x0018).is_respeaker());
    }
}
