// Remapd Button Debouncer
// Enforces a minimum interval between Downs of the same key

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::Key;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(25);

/// Filters switch bounce on worn mouse buttons: a Down arriving too soon
/// after the previous Down of the same key is delayed, not dropped. The
/// driver turns the returned delay into a scheduled flush.
pub struct ButtonDebouncer {
    interval: Duration,
    last_down: HashMap<Key, Instant>,
}

impl Default for ButtonDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl ButtonDebouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_down: HashMap::new(),
        }
    }

    /// Returns the remaining wait before this Down may be sent;
    /// `Duration::ZERO` means send now.
    ///
    /// `more_pending` marks a Down with further events queued behind it in
    /// the send buffer: part of a synthesized burst rather than a lone
    /// physical edge. Bursts are never delayed (holding one event back
    /// would stall the rest of the mapped output), but their Downs still
    /// refresh the bounce window.
    pub fn on_key_down(&mut self, key: Key, more_pending: bool) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_down.get(&key) {
            let elapsed = now.duration_since(*last);
            if elapsed < self.interval && !more_pending {
                return self.interval - elapsed;
            }
        }
        self.last_down.insert(key, now);
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_down_passes() {
        let mut debouncer = ButtonDebouncer::new(Duration::from_millis(50));
        assert_eq!(
            debouncer.on_key_down(Key::BUTTON_LEFT, false),
            Duration::ZERO
        );
    }

    #[test]
    fn test_bounce_is_delayed() {
        let mut debouncer = ButtonDebouncer::new(Duration::from_secs(10));
        assert_eq!(
            debouncer.on_key_down(Key::BUTTON_LEFT, false),
            Duration::ZERO
        );
        assert!(debouncer.on_key_down(Key::BUTTON_LEFT, false) > Duration::ZERO);
        // Other keys are unaffected.
        assert_eq!(
            debouncer.on_key_down(Key::BUTTON_RIGHT, false),
            Duration::ZERO
        );
    }

    #[test]
    fn test_burst_downs_are_not_delayed() {
        let mut debouncer = ButtonDebouncer::new(Duration::from_secs(10));
        assert_eq!(
            debouncer.on_key_down(Key::BUTTON_LEFT, false),
            Duration::ZERO
        );
        // Inside the bounce window but with more output queued behind it.
        assert_eq!(
            debouncer.on_key_down(Key::BUTTON_LEFT, true),
            Duration::ZERO
        );
        // The burst still refreshed the window for the next lone Down.
        assert!(debouncer.on_key_down(Key::BUTTON_LEFT, false) > Duration::ZERO);
    }
}
