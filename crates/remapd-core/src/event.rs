// Remapd Key Events
// KeyEvent and KeySequence shared by patterns, the input buffer and output

use std::fmt;
use std::time::Duration;

use crate::Key;

/// State of a key event.
///
/// Inputs only ever carry `Down` and `Up`. The remaining states exist for
/// patterns and for the stage's internal bookkeeping: `DownMatched` marks a
/// Down that already participated in a match, `UpAsync` an Up that may occur
/// out of order, and `Not` a negative predicate in patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Up,
    Down,
    UpAsync,
    DownMatched,
    Not,
}

/// A single key event, optionally carrying a timeout in milliseconds
/// (only meaningful for the `Timeout`/`InputTimeout` marker keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub state: KeyState,
    pub timeout: u16,
}

impl KeyEvent {
    pub fn new(key: Key, state: KeyState) -> Self {
        Self {
            key,
            state,
            timeout: 0,
        }
    }

    pub fn down(key: Key) -> Self {
        Self::new(key, KeyState::Down)
    }

    pub fn up(key: Key) -> Self {
        Self::new(key, KeyState::Up)
    }

    /// A `timeout` output marker or pattern element.
    pub fn timeout(millis: u16) -> Self {
        Self {
            key: Key::TIMEOUT,
            state: KeyState::Down,
            timeout: millis,
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout as u64)
    }
}

impl fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key == Key::TIMEOUT || self.key == Key::INPUT_TIMEOUT {
            return write!(f, "{}({}ms)", self.key, self.timeout);
        }
        let prefix = match self.state {
            KeyState::Down => "+",
            KeyState::Up => "-",
            KeyState::UpAsync => "~",
            KeyState::DownMatched => "#",
            KeyState::Not => "!",
        };
        write!(f, "{}{}", prefix, self.key)
    }
}

/// An ordered run of key events. Patterns and outputs are represented
/// identically to inputs; the matcher interprets the states as predicates.
pub type KeySequence = Vec<KeyEvent>;

/// Clamp a duration to the millisecond range a key event can carry.
pub fn duration_to_timeout(duration: Duration) -> u16 {
    duration.as_millis().min(u16::MAX as u128) as u16
}

/// The event the driver feeds back into the stage when an armed input
/// timeout fires (or, on cancellation, with the elapsed time so far).
pub fn make_input_timeout_event(elapsed: Duration) -> KeyEvent {
    KeyEvent {
        key: Key::INPUT_TIMEOUT,
        state: KeyState::Down,
        timeout: duration_to_timeout(elapsed),
    }
}

pub fn is_input_timeout_event(event: &KeyEvent) -> bool {
    event.key == Key::INPUT_TIMEOUT
}

/// Render a sequence as "+A -A ..." for logs and test assertions.
pub fn format_sequence(events: &[KeyEvent]) -> String {
    let mut out = String::new();
    for event in events {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&event.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        assert_eq!(KeyEvent::down(Key::A).to_string(), "+A");
        assert_eq!(KeyEvent::up(Key::B).to_string(), "-B");
        assert_eq!(KeyEvent::timeout(300).to_string(), "Timeout(300ms)");
        assert_eq!(
            KeyEvent::new(Key::X, KeyState::Not).to_string(),
            "!X"
        );
    }

    #[test]
    fn test_input_timeout_roundtrip() {
        let event = make_input_timeout_event(Duration::from_millis(250));
        assert!(is_input_timeout_event(&event));
        assert_eq!(event.timeout_duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_duration_clamp() {
        assert_eq!(duration_to_timeout(Duration::from_secs(3600)), u16::MAX);
        assert_eq!(duration_to_timeout(Duration::from_millis(10)), 10);
    }

    #[test]
    fn test_format_sequence() {
        let seq = vec![KeyEvent::down(Key::A), KeyEvent::up(Key::A)];
        assert_eq!(format_sequence(&seq), "+A -A");
    }
}
