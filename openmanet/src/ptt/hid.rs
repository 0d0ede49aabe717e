//! PTT button discovery.
//!
//! The button is a HID key on a CM108 compatible device, typically an AIOC USB soundcard. The
//! configured name is matched against the kernel input devices in three passes: exact name,
//! case insensitive substring, and finally the well known AIOC product names.

use std::path::PathBuf;

use tracing::{debug, info};

use super::PttError;

/// Product names the AIOC firmware registers under.
const AIOC_ALIASES: [&str; 2] = ["AIOC AIOC", "All-In-One-Cable"];

/// All kernel input devices, by node path and name.
pub fn list_input_devices() -> Vec<(PathBuf, String)> {
    evdev::enumerate()
        .map(|(path, device)| {
            let name = device.name().unwrap_or("<unnamed>").to_string();
            (path, name)
        })
        .collect()
}

/// Locate the PTT input device.
///
/// Aborts the subsystem when nothing matches; the discovered device list is logged to make the
/// misconfiguration obvious.
pub fn find_ptt_device(wanted: &str) -> Result<evdev::Device, PttError> {
    let devices: Vec<(PathBuf, evdev::Device)> = evdev::enumerate().collect();
    let names: Vec<String> = devices
        .iter()
        .map(|(_, device)| device.name().unwrap_or("<unnamed>").to_string())
        .collect();

    match select_device(&names, wanted) {
        Some(index) => {
            let (path, device) = devices.into_iter().nth(index).expect("index from same list");
            info!(name = %names[index], path = %path.display(), "PTT device found");
            Ok(device)
        }
        None => {
            for (path, name) in list_input_devices() {
                debug!(name = %name, path = %path.display(), "available input device");
            }
            Err(PttError::HidDeviceNotFound(wanted.to_string()))
        }
    }
}

/// The matching rules, separated from device enumeration: exact match wins over a case
/// insensitive substring match, which wins over the AIOC fallback names.
fn select_device(names: &[String], wanted: &str) -> Option<usize> {
    if let Some(index) = names.iter().position(|name| name == wanted) {
        return Some(index);
    }

    let wanted_lower = wanted.to_lowercase();
    if !wanted_lower.is_empty() {
        if let Some(index) = names
            .iter()
            .position(|name| name.to_lowercase().contains(&wanted_lower))
        {
            return Some(index);
        }
    }

    names
        .iter()
        .position(|name| AIOC_ALIASES.contains(&name.as_str()))
}
