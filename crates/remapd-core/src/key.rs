// Remapd Key Model
// Partitioned 32-bit key space covering physical evdev codes, logical
// aliases, virtual toggles, action tokens and matcher markers

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// A key identifier.
///
/// The code space is partitioned into disjoint ranges so that classifying a
/// key never needs a lookup table:
///
/// - `1..=0x2ff`: physical keys, identical to Linux input-event-codes
///   (keyboard keys and `BTN_*` pointer buttons)
/// - `0x400..=0x4ff`: logical keys (`both` identities resolving to a
///   left/right physical pair)
/// - `0x500..=0x5ff`: virtual keys (internal toggles)
/// - `0x600..=0x6ff`: action keys (`Down` means "trigger command N")
/// - `0` and `0x700..`: matcher markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(u32);

const LAST_PHYSICAL: u32 = 0x2ff;
const FIRST_LOGICAL: u32 = 0x400;
const FIRST_VIRTUAL: u32 = 0x500;
const FIRST_ACTION: u32 = 0x600;
const RANGE_SIZE: u32 = 0x100;

impl Key {
    pub const NONE: Key = Key(0);
    pub const ANY: Key = Key(0x700);
    pub const TIMEOUT: Key = Key(0x701);
    pub const INPUT_TIMEOUT: Key = Key(0x702);

    pub const ESC: Key = Key(1);
    pub const BACKSPACE: Key = Key(14);
    pub const TAB: Key = Key(15);
    pub const ENTER: Key = Key(28);
    pub const LEFT_CTRL: Key = Key(29);
    pub const A: Key = Key(30);
    pub const S: Key = Key(31);
    pub const LEFT_SHIFT: Key = Key(42);
    pub const Z: Key = Key(44);
    pub const X: Key = Key(45);
    pub const C: Key = Key(46);
    pub const B: Key = Key(48);
    pub const RIGHT_SHIFT: Key = Key(54);
    pub const LEFT_ALT: Key = Key(56);
    pub const SPACE: Key = Key(57);
    pub const CAPSLOCK: Key = Key(58);
    pub const F1: Key = Key(59);
    pub const RIGHT_CTRL: Key = Key(97);
    pub const RIGHT_ALT: Key = Key(100);
    pub const LEFT_META: Key = Key(125);
    pub const RIGHT_META: Key = Key(126);
    pub const BUTTON_LEFT: Key = Key(0x110);
    pub const BUTTON_RIGHT: Key = Key(0x111);
    pub const BUTTON_MIDDLE: Key = Key(0x112);

    /// Wrap a raw partitioned code.
    pub const fn from_code(code: u32) -> Key {
        Key(code)
    }

    /// A physical key from its evdev code.
    pub const fn physical(code: u16) -> Key {
        Key(code as u32)
    }

    /// The n-th logical key identity.
    pub const fn logical(index: u32) -> Key {
        Key(FIRST_LOGICAL + index)
    }

    /// The n-th virtual key.
    pub const fn virtual_key(index: u32) -> Key {
        Key(FIRST_VIRTUAL + index)
    }

    /// The n-th action key.
    pub const fn action(index: u32) -> Key {
        Key(FIRST_ACTION + index)
    }

    pub const fn code(self) -> u32 {
        self.0
    }

    pub const fn is_physical(self) -> bool {
        self.0 >= 1 && self.0 <= LAST_PHYSICAL
    }

    pub const fn is_logical(self) -> bool {
        self.0 >= FIRST_LOGICAL && self.0 < FIRST_LOGICAL + RANGE_SIZE
    }

    pub const fn is_virtual(self) -> bool {
        self.0 >= FIRST_VIRTUAL && self.0 < FIRST_VIRTUAL + RANGE_SIZE
    }

    pub const fn is_action(self) -> bool {
        self.0 >= FIRST_ACTION && self.0 < FIRST_ACTION + RANGE_SIZE
    }

    pub const fn is_marker(self) -> bool {
        self.0 == 0 || self.0 >= 0x700
    }

    /// Pointer buttons occupy the `BTN_MOUSE` slice of the physical range.
    pub const fn is_pointer_button(self) -> bool {
        self.0 >= 0x110 && self.0 <= 0x117
    }

    /// Physical modifier keys (both sides of Shift, Ctrl, Alt, Meta).
    pub fn is_modifier(self) -> bool {
        matches!(
            self,
            Key::LEFT_SHIFT
                | Key::RIGHT_SHIFT
                | Key::LEFT_CTRL
                | Key::RIGHT_CTRL
                | Key::LEFT_ALT
                | Key::RIGHT_ALT
                | Key::LEFT_META
                | Key::RIGHT_META
        )
    }

    /// The evdev code of a physical key.
    pub fn evdev_code(self) -> u16 {
        debug_assert!(self.is_physical());
        self.0 as u16
    }

    pub fn logical_index(self) -> Option<usize> {
        self.is_logical().then(|| (self.0 - FIRST_LOGICAL) as usize)
    }

    pub fn virtual_index(self) -> Option<usize> {
        self.is_virtual().then(|| (self.0 - FIRST_VIRTUAL) as usize)
    }

    pub fn action_index(self) -> Option<usize> {
        self.is_action().then(|| (self.0 - FIRST_ACTION) as usize)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Key::NONE {
            return write!(f, "None");
        }
        if *self == Key::ANY {
            return write!(f, "Any");
        }
        if *self == Key::TIMEOUT {
            return write!(f, "Timeout");
        }
        if *self == Key::INPUT_TIMEOUT {
            return write!(f, "InputTimeout");
        }
        if let Some(i) = self.virtual_index() {
            return write!(f, "Virtual{}", i);
        }
        if let Some(i) = self.action_index() {
            return write!(f, "Action{}", i);
        }
        if let Some(i) = self.logical_index() {
            return write!(f, "Logical{}", i);
        }
        match physical_key_name(self.0 as u16) {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "KEY_{}", self.0),
        }
    }
}

/// Name table for physical keys, shared by parsing and display.
/// The first entry per code is the canonical name, later ones are aliases.
static KEY_NAMES: &[(&str, u16)] = &[
    ("ESC", 1),
    ("ESCAPE", 1),
    ("1", 2),
    ("2", 3),
    ("3", 4),
    ("4", 5),
    ("5", 6),
    ("6", 7),
    ("7", 8),
    ("8", 9),
    ("9", 10),
    ("0", 11),
    ("MINUS", 12),
    ("EQUAL", 13),
    ("BACKSPACE", 14),
    ("TAB", 15),
    ("Q", 16),
    ("W", 17),
    ("E", 18),
    ("R", 19),
    ("T", 20),
    ("Y", 21),
    ("U", 22),
    ("I", 23),
    ("O", 24),
    ("P", 25),
    ("LEFT_BRACE", 26),
    ("RIGHT_BRACE", 27),
    ("ENTER", 28),
    ("RETURN", 28),
    ("LEFT_CTRL", 29),
    ("LEFTCTRL", 29),
    ("A", 30),
    ("S", 31),
    ("D", 32),
    ("F", 33),
    ("G", 34),
    ("H", 35),
    ("J", 36),
    ("K", 37),
    ("L", 38),
    ("SEMICOLON", 39),
    ("APOSTROPHE", 40),
    ("GRAVE", 41),
    ("LEFT_SHIFT", 42),
    ("LEFTSHIFT", 42),
    ("BACKSLASH", 43),
    ("Z", 44),
    ("X", 45),
    ("C", 46),
    ("V", 47),
    ("B", 48),
    ("N", 49),
    ("M", 50),
    ("COMMA", 51),
    ("DOT", 52),
    ("SLASH", 53),
    ("RIGHT_SHIFT", 54),
    ("RIGHTSHIFT", 54),
    ("KPASTERISK", 55),
    ("LEFT_ALT", 56),
    ("LEFTALT", 56),
    ("SPACE", 57),
    ("CAPSLOCK", 58),
    ("F1", 59),
    ("F2", 60),
    ("F3", 61),
    ("F4", 62),
    ("F5", 63),
    ("F6", 64),
    ("F7", 65),
    ("F8", 66),
    ("F9", 67),
    ("F10", 68),
    ("NUMLOCK", 69),
    ("SCROLLLOCK", 70),
    ("KP7", 71),
    ("KP8", 72),
    ("KP9", 73),
    ("KPMINUS", 74),
    ("KP4", 75),
    ("KP5", 76),
    ("KP6", 77),
    ("KPPLUS", 78),
    ("KP1", 79),
    ("KP2", 80),
    ("KP3", 81),
    ("KP0", 82),
    ("KPDOT", 83),
    ("F11", 87),
    ("F12", 88),
    ("KPENTER", 96),
    ("RIGHT_CTRL", 97),
    ("RIGHTCTRL", 97),
    ("KPSLASH", 98),
    ("SYSRQ", 99),
    ("PRINT", 99),
    ("RIGHT_ALT", 100),
    ("RIGHTALT", 100),
    ("HOME", 102),
    ("UP", 103),
    ("PAGE_UP", 104),
    ("PAGEUP", 104),
    ("LEFT", 105),
    ("RIGHT", 106),
    ("END", 107),
    ("DOWN", 108),
    ("PAGE_DOWN", 109),
    ("PAGEDOWN", 109),
    ("INSERT", 110),
    ("DELETE", 111),
    ("MUTE", 113),
    ("VOLUMEDOWN", 114),
    ("VOLUMEUP", 115),
    ("KPEQUAL", 117),
    ("PAUSE", 119),
    ("KPCOMMA", 121),
    ("LEFT_META", 125),
    ("LEFTMETA", 125),
    ("RIGHT_META", 126),
    ("RIGHTMETA", 126),
    ("COMPOSE", 127),
    ("MENU", 139),
    ("NEXTSONG", 163),
    ("PLAYPAUSE", 164),
    ("PREVIOUSSONG", 165),
    ("STOPCD", 166),
    ("F13", 183),
    ("F14", 184),
    ("F15", 185),
    ("F16", 186),
    ("F17", 187),
    ("F18", 188),
    ("F19", 189),
    ("F20", 190),
    ("F21", 191),
    ("F22", 192),
    ("F23", 193),
    ("F24", 194),
    ("BUTTON_LEFT", 0x110),
    ("BTN_LEFT", 0x110),
    ("BUTTON_RIGHT", 0x111),
    ("BTN_RIGHT", 0x111),
    ("BUTTON_MIDDLE", 0x112),
    ("BTN_MIDDLE", 0x112),
    ("BUTTON_SIDE", 0x113),
    ("BTN_SIDE", 0x113),
    ("BUTTON_EXTRA", 0x114),
    ("BTN_EXTRA", 0x114),
    ("BUTTON_FORWARD", 0x115),
    ("BUTTON_BACK", 0x116),
];

/// Canonical display name of a physical key code.
pub fn physical_key_name(code: u16) -> Option<&'static str> {
    static BY_CODE: OnceLock<HashMap<u16, &'static str>> = OnceLock::new();
    BY_CODE
        .get_or_init(|| {
            let mut map = HashMap::new();
            for (name, code) in KEY_NAMES {
                map.entry(*code).or_insert(*name);
            }
            map
        })
        .get(&code)
        .copied()
}

/// Parse a physical key name (case-insensitive, aliases accepted).
pub fn key_from_name(name: &str) -> Option<Key> {
    static BY_NAME: OnceLock<HashMap<String, u16>> = OnceLock::new();
    let map = BY_NAME.get_or_init(|| {
        KEY_NAMES
            .iter()
            .map(|(name, code)| (name.to_string(), *code))
            .collect()
    });
    map.get(&name.to_uppercase()).map(|&code| Key::physical(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_partitioning_is_disjoint() {
        let samples = [
            Key::A,
            Key::BUTTON_LEFT,
            Key::logical(0),
            Key::virtual_key(3),
            Key::action(7),
            Key::ANY,
            Key::TIMEOUT,
            Key::NONE,
        ];
        for key in samples {
            let classes = [
                key.is_physical(),
                key.is_logical(),
                key.is_virtual(),
                key.is_action(),
                key.is_marker(),
            ];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{}", key);
        }
    }

    #[test]
    fn test_key_from_name() {
        assert_eq!(key_from_name("a"), Some(Key::A));
        assert_eq!(key_from_name("ESCAPE"), Some(Key::ESC));
        assert_eq!(key_from_name("Esc"), Some(Key::ESC));
        assert_eq!(key_from_name("btn_left"), Some(Key::BUTTON_LEFT));
        assert_eq!(key_from_name("NoSuchKey"), None);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Key::A.to_string(), "A");
        assert_eq!(Key::ENTER.to_string(), "ENTER");
        assert_eq!(Key::virtual_key(1).to_string(), "Virtual1");
        assert_eq!(Key::action(0).to_string(), "Action0");
        assert_eq!(Key::ANY.to_string(), "Any");
    }

    #[test]
    fn test_action_indices() {
        assert_eq!(Key::action(9).action_index(), Some(9));
        assert_eq!(Key::A.action_index(), None);
        assert_eq!(Key::virtual_key(2).virtual_index(), Some(2));
    }

    #[test]
    fn test_modifier_classification() {
        assert!(Key::LEFT_SHIFT.is_modifier());
        assert!(Key::RIGHT_META.is_modifier());
        assert!(!Key::A.is_modifier());
        assert!(!Key::virtual_key(0).is_modifier());
    }

    #[test]
    fn test_pointer_buttons() {
        assert!(Key::BUTTON_LEFT.is_pointer_button());
        assert!(Key::BUTTON_LEFT.is_physical());
        assert!(!Key::A.is_pointer_button());
    }
}
