//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Which side of the audio graph a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Input devices only: likely captures system/output audio instead of a mic.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for this direction.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mix stereo",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "line in",
    "usb",
    "webcam",
];

/// Best-effort heuristic for loopback/system-output capture devices.
///
/// Capturing one of these feeds the model its own voice back, which the
/// server then treats as a barge-in.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for likely speech microphone quality/intent.
///
/// Higher is better. Non-loopback devices should be preferred.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Resolve a device by preferred name, then the host default, then the first
/// device the host lists.
#[cfg(feature = "audio-cpal")]
pub fn select_device(
    host: &cpal::Host,
    direction: DeviceDirection,
    preferred_name: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use crate::error::VoiceError;
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    let list = |host: &cpal::Host| -> crate::error::Result<Vec<cpal::Device>> {
        let devices = match direction {
            DeviceDirection::Input => host.input_devices().map(|d| d.collect()),
            DeviceDirection::Output => host.output_devices().map(|d| d.collect()),
        };
        devices.map_err(|e| VoiceError::AudioDevice(e.to_string()))
    };

    if let Some(preferred) = preferred_name {
        match list(host) {
            Ok(devices) => {
                if let Some(found) = devices
                    .into_iter()
                    .find(|d| d.name().map(|n| n == preferred).unwrap_or(false))
                {
                    return Ok(found);
                }
                warn!(?direction, "preferred device '{preferred}' not found, falling back");
            }
            Err(e) => warn!(?direction, "failed to list devices while resolving preference: {e}"),
        }
    }

    let default = match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    let fallback = list(host)?.into_iter().next().ok_or(match direction {
        DeviceDirection::Input => VoiceError::NoDefaultInputDevice,
        DeviceDirection::Output => VoiceError::NoDefaultOutputDevice,
    })?;
    warn!(?direction, "no default device, falling back to first available");
    Ok(fallback)
}

/// List all available input and output devices.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let mut inputs: Vec<DeviceInfo> = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_input.as_deref() == Some(name.as_str()),
                    is_loopback_like: is_loopback_like_name(&name),
                    name,
                    direction: DeviceDirection::Input,
                    is_recommended: false,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    };

    if let Some(best) = inputs
        .iter_mut()
        .max_by_key(|d| mic_preference_score(&d.name) + if d.is_default { 2 } else { 0 })
    {
        best.is_recommended = true;
    }
    inputs.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });

    let mut outputs: Vec<DeviceInfo> = match host.output_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                let is_default = default_output.as_deref() == Some(name.as_str());
                DeviceInfo {
                    name,
                    direction: DeviceDirection::Output,
                    is_default,
                    is_loopback_like: false,
                    is_recommended: is_default,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    };
    outputs.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));

    inputs.extend(outputs);
    inputs
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}
