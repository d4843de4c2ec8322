//! Capture device enumeration.
//!
//! The pipeline visualizes *system output*, so device selection prefers
//! loopback/monitor-style capture devices over microphones, falling back to
//! the default input when none exists.

use serde::{Deserialize, Serialize};

/// Metadata about an audio capture device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Heuristic flag for devices that capture system/output audio.
    pub is_loopback_like: bool,
    /// The device the backend would pick.
    pub is_preferred: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "monitor of",
    "monitor",
    "loopback",
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "virtual output",
    "blackhole",
    "soundflower",
    "mixage stereo",
    "mezcla estereo",
];

const MIC_KEYWORDS: &[&str] = &["microphone", "mic", "array", "headset", "webcam"];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for system-audio capture. Higher is better:
/// loopback-style devices rank above everything, bare microphones last.
pub fn capture_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = 0;
    if is_loopback_like_name(&lowered) {
        score += 16;
    }
    if MIC_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score -= 8;
    }
    score
}

/// List available capture devices, preferred-first.
///
/// Returns an empty `Vec` when enumeration fails outright.
#[cfg(feature = "audio-cpal")]
pub fn list_capture_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("failed to enumerate capture devices: {e}");
            return Vec::new();
        }
    };

    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Capture Device {}", idx + 1));
            let is_default = default_name.as_deref() == Some(name.as_str());
            let is_loopback_like = is_loopback_like_name(&name);
            DeviceInfo {
                name,
                is_default,
                is_loopback_like,
                is_preferred: false,
            }
        })
        .collect::<Vec<_>>();

    if let Some((idx, _)) = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| capture_preference_score(&d.name) + if d.is_default { 2 } else { 0 })
    {
        if let Some(best) = list.get_mut(idx) {
            best.is_preferred = true;
        }
    }

    list.sort_by_key(|d| {
        (
            !d.is_preferred,
            !d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

/// Pick the capture device the backend should open: the highest-scoring
/// loopback-like device if any, otherwise the default input.
#[cfg(feature = "audio-cpal")]
pub fn select_capture_device(host: &cpal::Host) -> crate::error::Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    use crate::error::SonoscopeError;

    let mut best: Option<(i32, cpal::Device)> = None;
    if let Ok(devices) = host.input_devices() {
        for device in devices {
            let Ok(name) = device.name() else { continue };
            let score = capture_preference_score(&name);
            if score > 0 && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, device));
            }
        }
    }

    if let Some((_, device)) = best {
        return Ok(device);
    }

    host.default_input_device()
        .ok_or(SonoscopeError::NoCaptureDevice)
}
