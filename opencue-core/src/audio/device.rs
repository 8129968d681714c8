//! Audio device enumeration and capture-source heuristics.
//!
//! The capture chain prefers, in order:
//! 1. a virtual-cable output tap (silent capture of the player's audio),
//! 2. a loopback-style device carrying the system output mix,
//! 3. a plain microphone input.
//!
//! Device intent is inferred from the OS-reported name. The keyword lists
//! cover the common Windows/ALSA spellings.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Heuristic flag for devices that capture system/output audio.
    pub is_loopback_like: bool,
    /// Heuristic flag for virtual-cable taps (VB-Cable and friends).
    pub is_virtual_cable: bool,
}

const VIRTUAL_CABLE_KEYWORDS: &[&str] = &[
    "cable output",
    "vb-audio",
    "virtual cable",
    "vb-cable",
];

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mixage stereo",
    "mezcla estereo",
    "mix stereo",
    "speakers (",
    "headphones (",
];

/// True when the device name identifies a virtual-cable tap.
pub fn is_virtual_cable_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    VIRTUAL_CABLE_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    is_virtual_cable_name(&lowered) || LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// List all available audio input devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
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
                    DeviceInfo {
                        is_loopback_like: is_loopback_like_name(&name),
                        is_virtual_cable: is_virtual_cable_name(&name),
                        name,
                        is_default,
                    }
                })
                .collect::<Vec<_>>();

            // Virtual cables first, then loopback taps, then plain inputs.
            list.sort_by_key(|d| {
                (
                    !d.is_virtual_cable,
                    !d.is_loopback_like,
                    !d.is_default,
                    d.name.to_ascii_lowercase(),
                )
            });
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}
