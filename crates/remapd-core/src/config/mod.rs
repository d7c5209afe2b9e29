// Remapd Configuration Model
// Compiled contexts, filters and mappings consumed by the stage

pub mod parser;
pub mod sequence;

pub use parser::{parse_config, ConfigError};
pub use sequence::{parse_sequence, SequenceKind};

use crate::event::{KeyEvent, KeySequence, KeyState};
use crate::Key;

/// A user-defined key identity that resolves to one of two physical keys.
#[derive(Debug, Clone)]
pub struct LogicalKey {
    pub name: String,
    pub both: Key,
    pub left: Key,
    pub right: Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalSide {
    Left,
    Right,
}

/// A textual filter: `|`-separated alternatives, each either an anchored
/// exact match (`^name$`) or a case-insensitive substring. A leading `(?i)`
/// is tolerated for configurations migrated from regex-based tools.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub pattern: String,
}

impl Filter {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        let value_lower = value.to_lowercase();
        self.pattern.split('|').any(|raw| {
            let mut token = raw.trim().to_lowercase();
            if let Some(stripped) = token.strip_prefix("(?i)") {
                token = stripped.trim().to_string();
            }
            if token.is_empty() {
                return false;
            }
            if token.starts_with('^') && token.ends_with('$') && token.len() >= 2 {
                let exact = &token[1..token.len() - 1];
                return !exact.is_empty() && value_lower == exact;
            }
            let token = token.trim_start_matches('^').trim_end_matches('$');
            !token.is_empty() && value_lower.contains(token)
        })
    }
}

/// Filters gating a context. `class`/`title`/`path` are evaluated by the
/// focus-tracking front-end; the stage only evaluates `device` (against
/// grabbed device names) and `modifier` (against held output keys).
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    pub class: Option<Filter>,
    pub title: Option<Filter>,
    pub path: Option<Filter>,
    pub device: Option<Filter>,
    /// `Down`/`Not` elements that must hold against the current key state.
    pub modifier: Option<KeySequence>,
}

impl ContextFilter {
    pub fn has_focus_filter(&self) -> bool {
        self.class.is_some() || self.title.is_some() || self.path.is_some()
    }
}

/// Output of a mapping: an explicit sequence, or a reference to a named
/// command whose sequence is resolved per context.
#[derive(Debug, Clone)]
pub enum MappingOutput {
    Sequence(KeySequence),
    Command(usize),
}

#[derive(Debug, Clone)]
pub struct Mapping {
    pub input: KeySequence,
    pub output: MappingOutput,
}

/// A block of mappings gated by filters.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub filter: ContextFilter,
    pub mappings: Vec<Mapping>,
    /// Per-context outputs for named commands: `(command index, output)`.
    pub command_outputs: Vec<(usize, KeySequence)>,
    /// When true, a non-match continues searching later contexts.
    pub fallthrough: bool,
}

/// A compiled configuration. The stage assumes it is well-formed; the
/// parser rejects anything else.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub contexts: Vec<Context>,
    pub logical_keys: Vec<LogicalKey>,
    /// Names of registered virtual keys, by virtual index.
    pub virtual_key_names: Vec<String>,
    /// Names of declared commands, by command index.
    pub command_names: Vec<String>,
    /// Shell commands for terminal actions, by action index.
    pub terminal_commands: Vec<String>,
    pub exit_sequence: KeySequence,
}

impl Config {
    /// Look up the logical-key entry for a `both` identity.
    pub fn logical_entry(&self, key: Key) -> Option<&LogicalKey> {
        key.logical_index().and_then(|i| self.logical_keys.get(i))
    }

    /// Resolve a logical identity to one side; physical keys pass through.
    pub fn resolve_logical(&self, key: Key, side: LogicalSide) -> Key {
        match self.logical_entry(key) {
            Some(entry) => match side {
                LogicalSide::Left => entry.left,
                LogicalSide::Right => entry.right,
            },
            None => key,
        }
    }

    /// True when any mapping references a pointer button, which requires
    /// the device layer to also grab pointer devices.
    pub fn has_mouse_mappings(&self) -> bool {
        let sequence_has_button = |seq: &KeySequence| {
            seq.iter().any(|e| {
                e.key.is_pointer_button()
                    || self
                        .logical_entry(e.key)
                        .is_some_and(|l| l.left.is_pointer_button() || l.right.is_pointer_button())
            })
        };
        self.contexts.iter().any(|context| {
            context.mappings.iter().any(|m| {
                sequence_has_button(&m.input)
                    || matches!(&m.output, MappingOutput::Sequence(seq) if sequence_has_button(seq))
            }) || context
                .command_outputs
                .iter()
                .any(|(_, seq)| sequence_has_button(seq))
        })
    }

    /// Evaluate a context's modifier filter against a key-down predicate.
    pub fn modifier_filter_matches(
        &self,
        filter: &[KeyEvent],
        is_down: impl Fn(Key) -> bool,
    ) -> bool {
        filter.iter().all(|event| {
            let down = match self.logical_entry(event.key) {
                Some(entry) => is_down(entry.left) || is_down(entry.right),
                None => is_down(event.key),
            };
            match event.state {
                KeyState::Not => !down,
                _ => down,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_substring() {
        let filter = Filter::new("firefox");
        assert!(filter.matches("Firefox"));
        assert!(filter.matches("org.mozilla.firefox"));
        assert!(!filter.matches("chromium"));
    }

    #[test]
    fn test_filter_anchored() {
        let filter = Filter::new("^kitty$");
        assert!(filter.matches("kitty"));
        assert!(filter.matches("Kitty"));
        assert!(!filter.matches("kitty-term"));
    }

    #[test]
    fn test_filter_alternation() {
        let filter = Filter::new("code|codium");
        assert!(filter.matches("VSCodium"));
        assert!(filter.matches("Code - OSS"));
        assert!(!filter.matches("emacs"));
    }

    #[test]
    fn test_filter_case_insensitive_prefix() {
        let filter = Filter::new("(?i)Chrome");
        assert!(filter.matches("google-chrome"));
    }

    #[test]
    fn test_resolve_logical() {
        let mut config = Config::default();
        config.logical_keys.push(LogicalKey {
            name: "shift".into(),
            both: Key::logical(0),
            left: Key::LEFT_SHIFT,
            right: Key::RIGHT_SHIFT,
        });
        assert_eq!(
            config.resolve_logical(Key::logical(0), LogicalSide::Right),
            Key::RIGHT_SHIFT
        );
        assert_eq!(config.resolve_logical(Key::A, LogicalSide::Left), Key::A);
    }

    #[test]
    fn test_modifier_filter() {
        let config = Config::default();
        let filter = vec![
            KeyEvent::down(Key::LEFT_CTRL),
            KeyEvent::new(Key::A, KeyState::Not),
        ];
        assert!(config.modifier_filter_matches(&filter, |k| k == Key::LEFT_CTRL));
        assert!(!config.modifier_filter_matches(&filter, |_| false));
        assert!(!config.modifier_filter_matches(&filter, |_| true));
    }
}
