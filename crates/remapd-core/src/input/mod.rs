// Remapd Input Layer
// Device classification and filtering for grabbing

pub mod grab;

pub use grab::{DeviceError, DeviceResult, GrabbedDevices, RawInputEvent};

use evdev::{Device, EventType};

/// Check if a device is our own virtual output device (or another
/// remapper's), which must never be grabbed to avoid a feedback loop.
pub fn is_virtual_device(device_name: &str, virtual_prefix: &str) -> bool {
    device_name.starts_with(virtual_prefix) || device_name.to_lowercase().contains("virtual")
}

/// Device selection: explicit name/path filters win; otherwise autodetect
/// takes every keyboard (and, when mouse mappings exist, pointer device)
/// that is not virtual.
pub fn matches_device_filter(
    device_name: &str,
    device_path: &str,
    filter_names: &[String],
    is_candidate: bool,
    is_virtual: bool,
) -> bool {
    if !filter_names.is_empty() {
        return filter_names
            .iter()
            .any(|f| device_path == f || device_name == f);
    }
    !is_virtual && is_candidate
}

/// A keyboard supports EV_KEY and the QWERTY row plus letters and space.
pub fn is_keyboard_device(device: &Device) -> bool {
    if !device.supported_events().contains(EventType::KEY) {
        return false;
    }
    let keys = match device.supported_keys() {
        Some(keys) => keys,
        None => return false,
    };
    const QWERTY_CODES: &[u16] = &[16, 17, 18, 19, 20, 21];
    const A_Z_SPACE_CODES: &[u16] = &[57, 30, 44];
    QWERTY_CODES
        .iter()
        .chain(A_Z_SPACE_CODES)
        .all(|code| keys.contains(evdev::Key::new(*code)))
}

/// A pointer device supports EV_KEY with BTN_LEFT.
pub fn is_pointer_device(device: &Device) -> bool {
    device.supported_events().contains(EventType::KEY)
        && device
            .supported_keys()
            .is_some_and(|keys| keys.contains(evdev::Key::BTN_LEFT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_device_detection() {
        assert!(is_virtual_device("Remapd Virtual Keyboard", "Remapd"));
        assert!(is_virtual_device("Some Virtual Pointer", "Remapd"));
        assert!(!is_virtual_device("Logitech USB Keyboard", "Remapd"));
    }

    #[test]
    fn test_explicit_filter_matches_name_or_path() {
        let filter = vec!["/dev/input/event3".to_string()];
        assert!(matches_device_filter(
            "Any Device",
            "/dev/input/event3",
            &filter,
            false,
            true
        ));
        assert!(!matches_device_filter(
            "Any Device",
            "/dev/input/event4",
            &filter,
            true,
            false
        ));
    }

    #[test]
    fn test_autodetect_excludes_virtual() {
        assert!(!matches_device_filter(
            "Remapd Virtual Keyboard",
            "/dev/input/event9",
            &[],
            true,
            true
        ));
        assert!(matches_device_filter(
            "Real Keyboard",
            "/dev/input/event1",
            &[],
            true,
            false
        ));
    }
}
