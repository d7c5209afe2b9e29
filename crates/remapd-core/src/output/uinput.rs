// Remapd Output Layer - uinput Virtual Device
// Creates the synthetic device and publishes key and raw events

use evdev::uinput::{VirtualDevice as UinputDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, RelativeAxisType};

use crate::event::{KeyEvent, KeyState};

/// Error types for uinput operations.
#[derive(Debug, thiserror::Error)]
pub enum UInputError {
    #[error("Failed to create virtual device: {0}")]
    DeviceCreation(String),

    #[error("Failed to write event: {0}")]
    WriteError(String),
}

/// The synthetic output device.
///
/// Key events and raw passthrough events are queued and written out in one
/// report per `flush`, mirroring the send/flush split of the driver loop.
pub struct VirtualDevice {
    device: UinputDevice,
    queue: Vec<InputEvent>,
}

impl VirtualDevice {
    /// Create the virtual device. The keyboard range plus pointer buttons
    /// and relative axes are registered so raw mouse events from grabbed
    /// pointer devices can be forwarded untranslated.
    pub fn create(name: &str) -> Result<Self, UInputError> {
        let mut keys = AttributeSet::new();
        for code in 1..0x2ffu16 {
            keys.insert(evdev::Key::new(code));
        }
        let mut axes = AttributeSet::new();
        axes.insert(RelativeAxisType::REL_X);
        axes.insert(RelativeAxisType::REL_Y);
        axes.insert(RelativeAxisType::REL_WHEEL);
        axes.insert(RelativeAxisType::REL_HWHEEL);

        let device = VirtualDeviceBuilder::new()
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?
            .name(name)
            .with_keys(&keys)
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?
            .with_relative_axes(&axes)
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?
            .build()
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?;

        Ok(Self {
            device,
            queue: Vec::new(),
        })
    }

    /// Queue a translated key event. Only physical keys reach this point;
    /// the stage's canonicalization keeps tokens and markers away.
    pub fn send_key_event(&mut self, event: &KeyEvent) -> Result<(), UInputError> {
        let value = match event.state {
            KeyState::Down | KeyState::DownMatched => 1,
            KeyState::Up | KeyState::UpAsync => 0,
            KeyState::Not => {
                log::warn!("dropping output event with invalid state: {}", event);
                return Ok(());
            }
        };
        self.queue
            .push(InputEvent::new(EventType::KEY, event.key.evdev_code(), value));
        Ok(())
    }

    /// Queue a raw event for untranslated passthrough.
    pub fn send_raw(&mut self, event_type: u16, code: u16, value: i32) {
        self.queue
            .push(InputEvent::new(EventType(event_type), code, value));
    }

    /// Write all queued events in one report.
    pub fn flush(&mut self) -> Result<(), UInputError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        self.device
            .emit(&self.queue)
            .map_err(|e: std::io::Error| UInputError::WriteError(e.to_string()))?;
        self.queue.clear();
        Ok(())
    }
}
