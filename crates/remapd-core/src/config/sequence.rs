// Remapd Config - Key Sequence Parser
// Parses sequence strings like "Ctrl-Shift-A B 300ms" into KeySequences

use std::fmt;

use crate::event::{KeyEvent, KeySequence, KeyState};
use crate::Key;

/// Whether a sequence string describes a pattern or an output.
///
/// Inputs compile with `UpAsync` releases so the matcher can fire on the
/// final Down edge and tolerate releases arriving out of order. Outputs
/// compile with explicit releases for every step but the last; the stage
/// holds the last step's keys until the trigger key is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Input,
    Output,
}

/// Errors from sequence-string parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceError {
    Empty,
    UnknownKey(String),
    TrailingHyphen(String),
    InvalidTimeout(String),
    CommandInInput,
    UnterminatedCommand,
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceError::Empty => write!(f, "sequence is empty"),
            SequenceError::UnknownKey(name) => write!(f, "unknown key name '{}'", name),
            SequenceError::TrailingHyphen(step) => {
                write!(f, "step '{}' ends with a hyphen", step)
            }
            SequenceError::InvalidTimeout(step) => {
                write!(f, "invalid timeout '{}'", step)
            }
            SequenceError::CommandInInput => {
                write!(f, "terminal commands are only allowed in outputs")
            }
            SequenceError::UnterminatedCommand => {
                write!(f, "unterminated $(...) command")
            }
        }
    }
}

impl std::error::Error for SequenceError {}

/// Name environment for sequence parsing. Implemented by the config parser,
/// which owns logical-key, virtual-key and terminal-command registration.
pub trait NameResolver {
    /// Resolve a key name to a physical or logical key.
    fn resolve_key(&mut self, name: &str) -> Option<Key>;
    /// Look up or register a virtual key by name.
    fn virtual_key(&mut self, name: &str) -> Key;
    /// Register a terminal command, returning its action key.
    fn terminal_command(&mut self, command: &str) -> Key;
}

/// Split a sequence string into step tokens. `$(...)` counts as a single
/// token and may contain whitespace.
fn tokenize(text: &str) -> Result<Vec<String>, SequenceError> {
    let mut tokens = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("$(") {
            let end = after.find(')').ok_or(SequenceError::UnterminatedCommand)?;
            tokens.push(format!("$({})", &after[..end]));
            rest = after[end + 1..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            tokens.push(rest[..end].to_string());
            rest = rest[end..].trim_start();
        }
    }
    if tokens.is_empty() {
        return Err(SequenceError::Empty);
    }
    Ok(tokens)
}

fn parse_timeout(token: &str) -> Option<Result<u16, SequenceError>> {
    let digits = token.strip_suffix("ms")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Some(Err(SequenceError::InvalidTimeout(token.to_string())));
    }
    Some(
        digits
            .parse::<u16>()
            .map_err(|_| SequenceError::InvalidTimeout(token.to_string())),
    )
}

/// One parsed `Mod-Mod-Key` chord.
struct Chord {
    holds: Vec<Key>,
    key: Key,
}

fn parse_chord(
    token: &str,
    resolver: &mut impl NameResolver,
) -> Result<Chord, SequenceError> {
    if token.ends_with('-') && token.len() > 1 {
        return Err(SequenceError::TrailingHyphen(token.to_string()));
    }
    let parts: Vec<&str> = token.split('-').collect();
    let (key_name, hold_names) = parts.split_last().expect("split always yields one part");
    let key = resolver
        .resolve_key(key_name)
        .ok_or_else(|| SequenceError::UnknownKey(key_name.to_string()))?;
    let mut holds = Vec::with_capacity(hold_names.len());
    for name in hold_names {
        holds.push(
            resolver
                .resolve_key(name)
                .ok_or_else(|| SequenceError::UnknownKey(name.to_string()))?,
        );
    }
    Ok(Chord {
        holds,
        key,
    })
}

/// Parse a whitespace-separated sequence string.
///
/// Step forms: `Key`, `Mod-Mod-Key`, `!Key`, `Nms`, `@virtual`, `Any`,
/// and (outputs only) `$(shell command)`.
pub fn parse_sequence(
    text: &str,
    kind: SequenceKind,
    resolver: &mut impl NameResolver,
) -> Result<KeySequence, SequenceError> {
    let tokens = tokenize(text)?;
    let mut sequence = KeySequence::new();
    // Holds released at the very end of an input pattern, reverse order.
    let mut pending_async: Vec<Key> = Vec::new();
    // Index where the last output step begins, so its releases can be
    // dropped again (the stage holds them until trigger release).
    let mut last_step_start = 0;

    for token in &tokens {
        last_step_start = sequence.len();

        if let Some(timeout) = parse_timeout(token) {
            sequence.push(KeyEvent::timeout(timeout?));
            continue;
        }

        if let Some(command) = token.strip_prefix("$(").and_then(|t| t.strip_suffix(')')) {
            if kind == SequenceKind::Input {
                return Err(SequenceError::CommandInInput);
            }
            sequence.push(KeyEvent::down(resolver.terminal_command(command.trim())));
            continue;
        }

        if let Some(name) = token.strip_prefix('@') {
            sequence.push(KeyEvent::down(resolver.virtual_key(name)));
            continue;
        }

        if let Some(name) = token.strip_prefix('!') {
            let key = resolver
                .resolve_key(name)
                .ok_or_else(|| SequenceError::UnknownKey(name.to_string()))?;
            sequence.push(KeyEvent::new(key, KeyState::Not));
            continue;
        }

        if token.eq_ignore_ascii_case("any") {
            sequence.push(KeyEvent::down(Key::ANY));
            if kind == SequenceKind::Input {
                sequence.push(KeyEvent::new(Key::ANY, KeyState::UpAsync));
            }
            continue;
        }

        let chord = parse_chord(token, resolver)?;
        for &hold in &chord.holds {
            sequence.push(KeyEvent::down(hold));
        }
        sequence.push(KeyEvent::down(chord.key));
        match kind {
            SequenceKind::Input => {
                sequence.push(KeyEvent::new(chord.key, KeyState::UpAsync));
                pending_async.extend_from_slice(&chord.holds);
            }
            SequenceKind::Output => {
                sequence.push(KeyEvent::up(chord.key));
                for &hold in chord.holds.iter().rev() {
                    sequence.push(KeyEvent::up(hold));
                }
            }
        }
    }

    match kind {
        SequenceKind::Input => {
            for key in pending_async.into_iter().rev() {
                sequence.push(KeyEvent::new(key, KeyState::UpAsync));
            }
        }
        SequenceKind::Output => {
            // Keep the last step pressed; the stage releases it when the
            // trigger key goes up.
            sequence.truncate(
                last_step_start
                    + sequence[last_step_start..]
                        .iter()
                        .take_while(|e| e.state != KeyState::Up)
                        .count(),
            );
        }
    }

    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::format_sequence;
    use crate::key::key_from_name;

    struct TestResolver {
        virtuals: Vec<String>,
        commands: Vec<String>,
    }

    impl TestResolver {
        fn new() -> Self {
            Self {
                virtuals: Vec::new(),
                commands: Vec::new(),
            }
        }
    }

    impl NameResolver for TestResolver {
        fn resolve_key(&mut self, name: &str) -> Option<Key> {
            key_from_name(name)
        }

        fn virtual_key(&mut self, name: &str) -> Key {
            if let Some(i) = self.virtuals.iter().position(|v| v == name) {
                return Key::virtual_key(i as u32);
            }
            self.virtuals.push(name.to_string());
            Key::virtual_key((self.virtuals.len() - 1) as u32)
        }

        fn terminal_command(&mut self, command: &str) -> Key {
            self.commands.push(command.to_string());
            Key::action((self.commands.len() - 1) as u32)
        }
    }

    fn parse(text: &str, kind: SequenceKind) -> KeySequence {
        parse_sequence(text, kind, &mut TestResolver::new()).unwrap()
    }

    #[test]
    fn test_single_key_input() {
        assert_eq!(format_sequence(&parse("A", SequenceKind::Input)), "+A ~A");
    }

    #[test]
    fn test_single_key_output_stays_held() {
        assert_eq!(format_sequence(&parse("B", SequenceKind::Output)), "+B");
    }

    #[test]
    fn test_two_step_input() {
        assert_eq!(
            format_sequence(&parse("A B", SequenceKind::Input)),
            "+A ~A +B ~B"
        );
    }

    #[test]
    fn test_chord_input_releases_holds_last() {
        assert_eq!(
            format_sequence(&parse("LEFT_CTRL-A", SequenceKind::Input)),
            "+LEFT_CTRL +A ~A ~LEFT_CTRL"
        );
    }

    #[test]
    fn test_multi_step_output_releases_intermediate() {
        assert_eq!(
            format_sequence(&parse("B C", SequenceKind::Output)),
            "+B -B +C"
        );
    }

    #[test]
    fn test_chord_output() {
        assert_eq!(
            format_sequence(&parse("LEFT_CTRL-C X", SequenceKind::Output)),
            "+LEFT_CTRL +C -C -LEFT_CTRL +X"
        );
    }

    #[test]
    fn test_timeout_step() {
        let seq = parse("A 300ms", SequenceKind::Input);
        assert_eq!(seq[2].key, Key::TIMEOUT);
        assert_eq!(seq[2].timeout, 300);
    }

    #[test]
    fn test_not_step() {
        let seq = parse("!LEFT_SHIFT A", SequenceKind::Input);
        assert_eq!(seq[0].state, KeyState::Not);
        assert_eq!(seq[0].key, Key::LEFT_SHIFT);
    }

    #[test]
    fn test_virtual_key_registration() {
        let mut resolver = TestResolver::new();
        let seq = parse_sequence("@boss", SequenceKind::Output, &mut resolver).unwrap();
        assert_eq!(seq[0].key, Key::virtual_key(0));
        let again = parse_sequence("@boss", SequenceKind::Output, &mut resolver).unwrap();
        assert_eq!(again[0].key, Key::virtual_key(0));
    }

    #[test]
    fn test_terminal_command_token() {
        let mut resolver = TestResolver::new();
        let seq =
            parse_sequence("$(notify-send hi there)", SequenceKind::Output, &mut resolver)
                .unwrap();
        assert_eq!(seq[0].key, Key::action(0));
        assert_eq!(resolver.commands[0], "notify-send hi there");
    }

    #[test]
    fn test_command_rejected_in_input() {
        let err =
            parse_sequence("$(ls)", SequenceKind::Input, &mut TestResolver::new()).unwrap_err();
        assert_eq!(err, SequenceError::CommandInInput);
    }

    #[test]
    fn test_unknown_key() {
        let err = parse_sequence("Blorp", SequenceKind::Input, &mut TestResolver::new())
            .unwrap_err();
        assert_eq!(err, SequenceError::UnknownKey("Blorp".to_string()));
    }

    #[test]
    fn test_trailing_hyphen() {
        let err = parse_sequence("Ctrl-", SequenceKind::Input, &mut TestResolver::new())
            .unwrap_err();
        assert!(matches!(err, SequenceError::TrailingHyphen(_)));
    }

    #[test]
    fn test_bad_timeout() {
        let err = parse_sequence("abcms", SequenceKind::Input, &mut TestResolver::new())
            .unwrap_err();
        assert!(matches!(err, SequenceError::InvalidTimeout(_)));
    }
}
