// Remapd Input Layer - Device Grabbing
// Exclusive evdev access with poll-based reads and udev hotplug

use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use evdev::Device;
use udev::MonitorSocket;

use crate::input::{
    is_keyboard_device, is_pointer_device, is_virtual_device, matches_device_filter,
};

/// Result type for device-layer operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No matching input devices found")]
    NoDevices,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw event read from a grabbed device.
#[derive(Debug, Clone, Copy)]
pub struct RawInputEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
    pub device_index: usize,
}

/// Device information for `--list-devices`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub path: String,
}

/// Grabbed input devices.
///
/// Owns the exclusive grab on every selected keyboard (and pointer device
/// when mouse mappings are present), multiplexes reads with `libc::poll`,
/// and follows hotplug through a udev monitor socket.
pub struct GrabbedDevices {
    devices: Vec<Device>,
    device_paths: Vec<String>,
    device_names: Vec<String>,
    udev_monitor: Option<MonitorSocket>,
    device_filter: Vec<String>,
    grab_mice: bool,
    pending: VecDeque<RawInputEvent>,
    changed: bool,
}

impl GrabbedDevices {
    /// Name prefix of our own virtual device, never grabbed.
    pub const VIRT_DEVICE_PREFIX: &'static str = "Remapd";

    /// Poll flags indicating device disconnection.
    const DISCONNECT_FLAGS: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

    /// Grab all matching devices. `filter` holds explicit device names or
    /// paths; when empty, keyboards are autodetected and pointer devices
    /// are included iff `grab_mice`.
    pub fn grab(filter: &[String], grab_mice: bool) -> DeviceResult<Self> {
        let mut grabbed = Self {
            devices: Vec::new(),
            device_paths: Vec::new(),
            device_names: Vec::new(),
            udev_monitor: Self::create_udev_monitor()?,
            device_filter: filter.to_vec(),
            grab_mice,
            pending: VecDeque::new(),
            changed: false,
        };
        grabbed.rescan_devices();
        if grabbed.devices.is_empty() {
            return Err(DeviceError::NoDevices);
        }
        grabbed.changed = false;
        Ok(grabbed)
    }

    fn create_udev_monitor() -> DeviceResult<Option<MonitorSocket>> {
        match udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem("input"))
            .and_then(|b| b.listen())
        {
            Ok(socket) => Ok(Some(socket)),
            Err(e) => {
                log::warn!("udev monitor unavailable, hotplug disabled: {}", e);
                Ok(None)
            }
        }
    }

    fn device_selected(&self, name: &str, path: &str, device: &Device) -> bool {
        let is_candidate =
            is_keyboard_device(device) || (self.grab_mice && is_pointer_device(device));
        let is_virtual = is_virtual_device(name, Self::VIRT_DEVICE_PREFIX);
        matches_device_filter(name, path, &self.device_filter, is_candidate, is_virtual)
    }

    /// Grab devices that appeared since the last scan.
    fn rescan_devices(&mut self) {
        for (path, mut device) in evdev::enumerate() {
            let path = path.to_string_lossy().to_string();
            if self.device_paths.contains(&path) {
                continue;
            }
            let name = device.name().unwrap_or("Unknown").to_string();
            if !self.device_selected(&name, &path, &device) {
                continue;
            }
            // A previous instance may have crashed while holding the grab;
            // start from a clean state.
            let _ = device.ungrab();
            match device.grab() {
                Ok(()) => {
                    log::info!("Grabbed device: {} ({})", name, path);
                    self.devices.push(device);
                    self.device_paths.push(path);
                    self.device_names.push(name);
                    self.changed = true;
                }
                Err(e) => log::warn!("Could not grab device {}: {}", name, e),
            }
        }
    }

    fn handle_udev_events(&mut self) {
        let Some(monitor) = self.udev_monitor.as_mut() else {
            return;
        };
        let mut rescan = false;
        for event in monitor.iter() {
            if matches!(
                event.event_type(),
                udev::EventType::Add | udev::EventType::Remove
            ) {
                rescan = true;
            }
        }
        if rescan {
            // Removed devices show up as POLLHUP on their fds; here we only
            // pick up additions.
            self.rescan_devices();
        }
    }

    fn remove_device(&mut self, index: usize) {
        log::warn!("Device disconnected: {}", self.device_names[index]);
        self.devices.remove(index);
        self.device_paths.remove(index);
        self.device_names.remove(index);
        self.changed = true;
    }

    /// Names of currently grabbed devices, indexed like the
    /// `device_index` carried by events.
    pub fn grabbed_device_names(&self) -> &[String] {
        &self.device_names
    }

    /// True once after the grabbed device set changed (hotplug), so the
    /// caller can re-evaluate device filters.
    pub fn take_devices_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Wait for the next input event.
    ///
    /// Returns `Ok(None)` on timeout, EINTR, or readiness of
    /// `interrupt_fd` (pass a negative fd to disable interruption).
    pub fn read_input_event(
        &mut self,
        timeout: Option<Duration>,
        interrupt_fd: i32,
    ) -> DeviceResult<Option<RawInputEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let mut poll_fds: Vec<libc::pollfd> = Vec::with_capacity(self.devices.len() + 2);
        let udev_offset = usize::from(self.udev_monitor.is_some());
        if let Some(monitor) = &self.udev_monitor {
            poll_fds.push(libc::pollfd {
                fd: monitor.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        for device in &self.devices {
            poll_fds.push(libc::pollfd {
                fd: device.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if interrupt_fd >= 0 {
            poll_fds.push(libc::pollfd {
                fd: interrupt_fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let result = unsafe {
            libc::poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            // EINTR just means a signal arrived; the caller checks its
            // running flag and retries.
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(DeviceError::Io(err));
        }
        if result == 0 {
            return Ok(None);
        }

        if udev_offset > 0 && poll_fds[0].revents & libc::POLLIN != 0 {
            self.handle_udev_events();
        }

        let mut disconnected: Vec<usize> = Vec::new();
        for index in 0..self.devices.len() {
            let revents = poll_fds[index + udev_offset].revents;
            if revents & Self::DISCONNECT_FLAGS != 0 {
                disconnected.push(index);
                continue;
            }
            if revents & libc::POLLIN != 0 {
                match self.devices[index].fetch_events() {
                    Ok(events) => {
                        for event in events {
                            if event.event_type() == evdev::EventType::SYNCHRONIZATION {
                                continue;
                            }
                            self.pending.push_back(RawInputEvent {
                                event_type: event.event_type().0,
                                code: event.code(),
                                value: event.value(),
                                device_index: index,
                            });
                        }
                    }
                    Err(e) => log::warn!(
                        "Reading from {} failed: {}",
                        self.device_names[index],
                        e
                    ),
                }
            }
        }
        for index in disconnected.into_iter().rev() {
            self.remove_device(index);
        }

        Ok(self.pending.pop_front())
    }

    /// Release all grabs (also done on drop).
    pub fn ungrab_all(&mut self) {
        for device in &mut self.devices {
            let _ = device.ungrab();
        }
    }

    /// Enumerate candidate devices for `--list-devices`.
    pub fn list_devices() -> DeviceResult<Vec<DeviceInfo>> {
        let mut infos = Vec::new();
        for (path, device) in evdev::enumerate() {
            let name = device.name().unwrap_or("Unknown").to_string();
            if is_virtual_device(&name, Self::VIRT_DEVICE_PREFIX) {
                continue;
            }
            if is_keyboard_device(&device) || is_pointer_device(&device) {
                infos.push(DeviceInfo {
                    index: infos.len(),
                    name,
                    path: path.to_string_lossy().to_string(),
                });
            }
        }
        if infos.is_empty() {
            return Err(DeviceError::NoDevices);
        }
        Ok(infos)
    }
}

impl Drop for GrabbedDevices {
    fn drop(&mut self) {
        self.ungrab_all();
    }
}
