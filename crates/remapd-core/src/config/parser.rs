// Remapd Config Parser - TOML with Serde
// Compiles configuration text into the Config consumed by the stage

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::config::sequence::{parse_sequence, NameResolver, SequenceError, SequenceKind};
use crate::config::{Config, Context, ContextFilter, Filter, LogicalKey, Mapping, MappingOutput};
use crate::event::{KeyEvent, KeySequence, KeyState};
use crate::key::key_from_name;
use crate::Key;

const DEFAULT_EXIT_SEQUENCE: &str = "Shift-Escape X";
const MACRO_EXPANSION_LIMIT: usize = 8;

/// Configuration parser errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(String),

    #[error("in mapping '{mapping}': {source}")]
    Sequence {
        mapping: String,
        source: SequenceError,
    },

    #[error("logical key '{name}': unknown side '{side}'")]
    LogicalSide { name: String, side: String },

    #[error("command '{0}' has no output in any context")]
    UndefinedCommand(String),

    #[error("invalid modifier filter '{0}'")]
    ModifierFilter(String),
}

/// Raw TOML structure. Mapping and command tables use arrays of pairs so
/// that declaration order is preserved for the matcher's tie-breaking.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    exit_sequence: Option<String>,

    #[serde(default)]
    logical_keys: BTreeMap<String, [String; 2]>,

    #[serde(default)]
    macros: BTreeMap<String, String>,

    #[serde(default, rename = "context")]
    contexts: Vec<ContextToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContextToml {
    class: Option<String>,
    title: Option<String>,
    path: Option<String>,
    device: Option<String>,
    modifier: Option<String>,

    #[serde(default)]
    fallthrough: bool,

    #[serde(default)]
    mappings: Vec<[String; 2]>,

    #[serde(default)]
    commands: Vec<[String; 2]>,
}

/// Mutable name environment threaded through sequence parsing.
struct ParserState {
    logical_keys: Vec<LogicalKey>,
    logical_aliases: HashMap<String, usize>,
    virtual_key_names: Vec<String>,
    command_names: Vec<String>,
    terminal_commands: Vec<String>,
}

impl ParserState {
    fn new() -> Self {
        let mut state = Self {
            logical_keys: Vec::new(),
            logical_aliases: HashMap::new(),
            virtual_key_names: Vec::new(),
            command_names: Vec::new(),
            terminal_commands: Vec::new(),
        };
        // Built-in logical modifiers; user definitions come on top.
        state.add_logical("shift", &["shift"], Key::LEFT_SHIFT, Key::RIGHT_SHIFT);
        state.add_logical(
            "control",
            &["control", "ctrl"],
            Key::LEFT_CTRL,
            Key::RIGHT_CTRL,
        );
        state.add_logical("alt", &["alt"], Key::LEFT_ALT, Key::RIGHT_ALT);
        state.add_logical(
            "meta",
            &["meta", "super", "win", "cmd"],
            Key::LEFT_META,
            Key::RIGHT_META,
        );
        state
    }

    fn add_logical(&mut self, name: &str, aliases: &[&str], left: Key, right: Key) -> Key {
        let index = self.logical_keys.len();
        let both = Key::logical(index as u32);
        self.logical_keys.push(LogicalKey {
            name: name.to_string(),
            both,
            left,
            right,
        });
        for alias in aliases {
            self.logical_aliases.insert(alias.to_lowercase(), index);
        }
        both
    }

    fn command_index(&mut self, name: &str) -> usize {
        if let Some(i) = self.command_names.iter().position(|c| c == name) {
            return i;
        }
        self.command_names.push(name.to_string());
        self.command_names.len() - 1
    }
}

impl NameResolver for ParserState {
    fn resolve_key(&mut self, name: &str) -> Option<Key> {
        if let Some(&index) = self.logical_aliases.get(&name.to_lowercase()) {
            return Some(self.logical_keys[index].both);
        }
        key_from_name(name)
    }

    fn virtual_key(&mut self, name: &str) -> Key {
        let lowered = name.to_lowercase();
        if let Some(i) = self
            .virtual_key_names
            .iter()
            .position(|v| v.to_lowercase() == lowered)
        {
            return Key::virtual_key(i as u32);
        }
        self.virtual_key_names.push(name.to_string());
        Key::virtual_key((self.virtual_key_names.len() - 1) as u32)
    }

    fn terminal_command(&mut self, command: &str) -> Key {
        self.terminal_commands.push(command.to_string());
        Key::action((self.terminal_commands.len() - 1) as u32)
    }
}

/// Expand macro tokens (whole-word, outermost first) before sequence parsing.
fn expand_macros(text: &str, macros: &BTreeMap<String, String>) -> String {
    let mut current = text.to_string();
    for _ in 0..MACRO_EXPANSION_LIMIT {
        let expanded: String = current
            .split_whitespace()
            .map(|token| macros.get(token).map(String::as_str).unwrap_or(token))
            .collect::<Vec<_>>()
            .join(" ");
        if expanded == current {
            break;
        }
        current = expanded;
    }
    current
}

/// A command reference is a single bare identifier that is not a key name.
fn looks_like_command(output: &str, state: &mut ParserState) -> bool {
    let token = output.trim();
    !token.is_empty()
        && !token.contains(char::is_whitespace)
        && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && state.resolve_key(token).is_none()
}

/// Parse the modifier filter of a context: whitespace-separated `Key`,
/// `!Key` or `@virtual` terms that must all hold.
fn parse_modifier_filter(
    text: &str,
    state: &mut ParserState,
) -> Result<KeySequence, ConfigError> {
    let mut filter = KeySequence::new();
    for token in text.split_whitespace() {
        let (name, filter_state) = match token.strip_prefix('!') {
            Some(rest) => (rest, KeyState::Not),
            None => (token, KeyState::Down),
        };
        let key = if let Some(virtual_name) = name.strip_prefix('@') {
            state.virtual_key(virtual_name)
        } else {
            state
                .resolve_key(name)
                .ok_or_else(|| ConfigError::ModifierFilter(text.to_string()))?
        };
        filter.push(KeyEvent::new(key, filter_state));
    }
    if filter.is_empty() {
        return Err(ConfigError::ModifierFilter(text.to_string()));
    }
    Ok(filter)
}

fn parse_mapping_sequence(
    text: &str,
    kind: SequenceKind,
    state: &mut ParserState,
) -> Result<KeySequence, ConfigError> {
    parse_sequence(text, kind, state).map_err(|source| ConfigError::Sequence {
        mapping: text.to_string(),
        source,
    })
}

/// Parse configuration text into a compiled [`Config`].
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let raw: ConfigToml = toml::from_str(text).map_err(|e| ConfigError::Toml(e.to_string()))?;
    let mut state = ParserState::new();

    for (name, sides) in &raw.logical_keys {
        let left = key_from_name(&sides[0]).ok_or_else(|| ConfigError::LogicalSide {
            name: name.clone(),
            side: sides[0].clone(),
        })?;
        let right = key_from_name(&sides[1]).ok_or_else(|| ConfigError::LogicalSide {
            name: name.clone(),
            side: sides[1].clone(),
        })?;
        state.add_logical(name, &[name.as_str()], left, right);
    }

    let mut contexts = Vec::with_capacity(raw.contexts.len());
    for context_toml in &raw.contexts {
        let mut context = Context {
            filter: ContextFilter {
                class: context_toml.class.as_deref().map(Filter::new),
                title: context_toml.title.as_deref().map(Filter::new),
                path: context_toml.path.as_deref().map(Filter::new),
                device: context_toml.device.as_deref().map(Filter::new),
                modifier: None,
            },
            mappings: Vec::with_capacity(context_toml.mappings.len()),
            command_outputs: Vec::with_capacity(context_toml.commands.len()),
            fallthrough: context_toml.fallthrough,
        };
        if let Some(modifier) = &context_toml.modifier {
            context.filter.modifier = Some(parse_modifier_filter(modifier, &mut state)?);
        }

        for [input_text, output_text] in &context_toml.mappings {
            let input_text = expand_macros(input_text, &raw.macros);
            let output_text = expand_macros(output_text, &raw.macros);
            let input = parse_mapping_sequence(&input_text, SequenceKind::Input, &mut state)?;
            let output = if output_text.trim().is_empty() {
                // An empty output suppresses the input entirely.
                MappingOutput::Sequence(KeySequence::new())
            } else if looks_like_command(&output_text, &mut state) {
                MappingOutput::Command(state.command_index(output_text.trim()))
            } else {
                MappingOutput::Sequence(parse_mapping_sequence(
                    &output_text,
                    SequenceKind::Output,
                    &mut state,
                )?)
            };
            context.mappings.push(Mapping { input, output });
        }

        for [name, output_text] in &context_toml.commands {
            let index = state.command_index(name.trim());
            let output_text = expand_macros(output_text, &raw.macros);
            let output = if output_text.trim().is_empty() {
                KeySequence::new()
            } else {
                parse_mapping_sequence(&output_text, SequenceKind::Output, &mut state)?
            };
            context.command_outputs.push((index, output));
        }

        contexts.push(context);
    }

    // Every referenced command needs an output somewhere.
    for (index, name) in state.command_names.iter().enumerate() {
        let defined = contexts
            .iter()
            .any(|c| c.command_outputs.iter().any(|(i, _)| *i == index));
        if !defined {
            return Err(ConfigError::UndefinedCommand(name.clone()));
        }
    }

    let exit_text = raw.exit_sequence.as_deref().unwrap_or(DEFAULT_EXIT_SEQUENCE);
    let exit_sequence = parse_mapping_sequence(exit_text, SequenceKind::Input, &mut state)?;

    let config = Config {
        contexts,
        logical_keys: state.logical_keys,
        virtual_key_names: state.virtual_key_names,
        command_names: state.command_names,
        terminal_commands: state.terminal_commands,
        exit_sequence,
    };
    log::debug!(
        "parsed configuration: {} context(s), {} logical key(s), {} command(s)",
        config.contexts.len(),
        config.logical_keys.len(),
        config.command_names.len()
    );
    Ok(config)
}

/// Read and parse a configuration file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path)?;
    parse_config(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::format_sequence;

    #[test]
    fn test_minimal_config() {
        let config = parse_config(
            r#"
            [[context]]
            mappings = [["A", "B"]]
            "#,
        )
        .unwrap();
        assert_eq!(config.contexts.len(), 1);
        let mapping = &config.contexts[0].mappings[0];
        assert_eq!(format_sequence(&mapping.input), "+A ~A");
        match &mapping.output {
            MappingOutput::Sequence(seq) => assert_eq!(format_sequence(seq), "+B"),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_builtin_logical_shift() {
        let config = parse_config(
            r#"
            [[context]]
            mappings = [["Shift-A", "B"]]
            "#,
        )
        .unwrap();
        let input = &config.contexts[0].mappings[0].input;
        assert!(input[0].key.is_logical());
        let entry = config.logical_entry(input[0].key).unwrap();
        assert_eq!(entry.left, Key::LEFT_SHIFT);
        assert_eq!(entry.right, Key::RIGHT_SHIFT);
    }

    #[test]
    fn test_user_logical_key() {
        let config = parse_config(
            r#"
            [logical_keys]
            thumb = ["SPACE", "CAPSLOCK"]

            [[context]]
            mappings = [["thumb-A", "B"]]
            "#,
        )
        .unwrap();
        let input = &config.contexts[0].mappings[0].input;
        let entry = config.logical_entry(input[0].key).unwrap();
        assert_eq!(entry.left, Key::SPACE);
        assert_eq!(entry.right, Key::CAPSLOCK);
    }

    #[test]
    fn test_macros_expand_in_sequences() {
        let config = parse_config(
            r#"
            [macros]
            Chord = "LEFT_CTRL-K"

            [[context]]
            mappings = [["Chord X", "B"]]
            "#,
        )
        .unwrap();
        let input = &config.contexts[0].mappings[0].input;
        assert_eq!(input[0].key, Key::LEFT_CTRL);
    }

    #[test]
    fn test_command_reference_and_output() {
        let config = parse_config(
            r#"
            [[context]]
            class = "editor"
            fallthrough = true
            mappings = [["F1", "open_terminal"]]
            commands = [["open_terminal", "LEFT_CTRL-T"]]
            "#,
        )
        .unwrap();
        let context = &config.contexts[0];
        assert!(matches!(
            context.mappings[0].output,
            MappingOutput::Command(0)
        ));
        assert_eq!(context.command_outputs[0].0, 0);
        assert_eq!(config.command_names, vec!["open_terminal".to_string()]);
    }

    #[test]
    fn test_undefined_command_rejected() {
        let err = parse_config(
            r#"
            [[context]]
            mappings = [["F1", "missing_cmd"]]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedCommand(name) if name == "missing_cmd"));
    }

    #[test]
    fn test_modifier_filter_with_virtual() {
        let config = parse_config(
            r#"
            [[context]]
            modifier = "@nav !LEFT_SHIFT"
            mappings = [["H", "LEFT"]]
            "#,
        )
        .unwrap();
        let filter = config.contexts[0].filter.modifier.as_ref().unwrap();
        assert_eq!(filter[0].key, Key::virtual_key(0));
        assert_eq!(filter[1].state, KeyState::Not);
        assert_eq!(config.virtual_key_names, vec!["nav".to_string()]);
    }

    #[test]
    fn test_exit_sequence_default() {
        let config = parse_config("").unwrap();
        assert!(!config.exit_sequence.is_empty());
    }

    #[test]
    fn test_exit_sequence_custom() {
        let config = parse_config(r#"exit_sequence = "LEFT_CTRL-Q""#).unwrap();
        assert_eq!(config.exit_sequence[0].key, Key::LEFT_CTRL);
    }

    #[test]
    fn test_has_mouse_mappings() {
        let with_mouse = parse_config(
            r#"
            [[context]]
            mappings = [["BUTTON_SIDE", "LEFT_CTRL-C"]]
            "#,
        )
        .unwrap();
        assert!(with_mouse.has_mouse_mappings());

        let without = parse_config(
            r#"
            [[context]]
            mappings = [["A", "B"]]
            "#,
        )
        .unwrap();
        assert!(!without.has_mouse_mappings());
    }

    #[test]
    fn test_toml_error_reported() {
        let err = parse_config("not [ valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_empty_output_suppresses() {
        let config = parse_config(
            r#"
            [[context]]
            mappings = [["CAPSLOCK", ""]]
            "#,
        )
        .unwrap();
        match &config.contexts[0].mappings[0].output {
            MappingOutput::Sequence(seq) => assert!(seq.is_empty()),
            other => panic!("unexpected output {:?}", other),
        }
    }
}
