// Remapd Stage
// The translation state machine between grabbed input and virtual output

use smallvec::SmallVec;

use crate::config::{Config, LogicalSide, MappingOutput};
use crate::event::{KeyEvent, KeySequence, KeyState};
use crate::matcher::{BufferedEvent, MatchResult, MatchState, Matcher, NO_DEVICE};
use crate::Key;

/// A key currently held on the virtual device, with the input key whose
/// release takes it back up.
#[derive(Debug, Clone, Copy)]
struct OutputDown {
    key: Key,
    trigger: Key,
}

/// Identity of a match candidate found during a search pass.
#[derive(Debug, Clone, Copy)]
enum Candidate {
    Mapping { context: usize, mapping: usize },
    Exit,
}

#[derive(Default)]
struct Search {
    best: Option<(Candidate, MatchState)>,
    might_match: bool,
    timeout_request: Option<u16>,
}

/// The translation stage.
///
/// Consumes `(key event, device index)` pairs and produces the canonical
/// output stream for the driver: translated key events plus `timeout` and
/// `input_timeout` markers and action/virtual key tokens. Single-threaded
/// and non-reentrant; the driver owns all waiting.
pub struct Stage {
    config: Config,
    /// Focus eligibility per context, replaced by `set_active_contexts`.
    focus_active: Vec<bool>,
    /// Per context: indices of grabbed devices its device filter matches
    /// (`None` when the context has no device filter).
    device_matches: Vec<Option<Vec<usize>>>,
    /// Pending input events plus retained `DownMatched` context.
    buffer: Vec<BufferedEvent>,
    output_down: Vec<OutputDown>,
    /// Modifiers temporarily released for a match, re-pressed when the
    /// trigger key goes up: `(trigger, modifier)`.
    restore_on_release: Vec<(Key, Key)>,
    /// Physical keys currently held on the input side.
    keys_down: Vec<Key>,
    toggled_virtual_keys: Vec<Key>,
    should_exit: bool,
    spare_buffer: Vec<KeyEvent>,
}

impl Stage {
    pub fn new(config: Config) -> Self {
        let focus_active = config
            .contexts
            .iter()
            .map(|c| !c.filter.has_focus_filter())
            .collect();
        let device_matches = config
            .contexts
            .iter()
            .map(|c| c.filter.device.as_ref().map(|_| Vec::new()))
            .collect();
        Self {
            config,
            focus_active,
            device_matches,
            buffer: Vec::new(),
            output_down: Vec::new(),
            restore_on_release: Vec::new(),
            keys_down: Vec::new(),
            toggled_virtual_keys: Vec::new(),
            should_exit: false,
            spare_buffer: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_mouse_mappings(&self) -> bool {
        self.config.has_mouse_mappings()
    }

    pub fn is_output_down(&self) -> bool {
        !self.output_down.is_empty()
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit
    }

    /// Declare which contexts are focus-eligible. Idempotent; activation is
    /// a pure function of the given indices.
    pub fn set_active_contexts(&mut self, indices: &[usize]) {
        for flag in self.focus_active.iter_mut() {
            *flag = false;
        }
        for &index in indices {
            if let Some(flag) = self.focus_active.get_mut(index) {
                *flag = true;
            }
        }
    }

    /// Recompute per-context device-filter activation from the list of
    /// grabbed device names.
    pub fn evaluate_device_filters(&mut self, device_names: &[String]) {
        for (context, matches) in self.config.contexts.iter().zip(&mut self.device_matches) {
            *matches = context.filter.device.as_ref().map(|filter| {
                device_names
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| filter.matches(name))
                    .map(|(index, _)| index)
                    .collect()
            });
        }
    }

    /// Hand a drained output vector back for reuse. Purely an allocation
    /// contract; behavior is identical with or without it.
    pub fn reuse_buffer(&mut self, mut buffer: Vec<KeyEvent>) {
        buffer.clear();
        self.spare_buffer = buffer;
    }

    /// Main entry: translate one input event from `device` into output
    /// events for the driver to send, schedule or dispatch.
    pub fn update(&mut self, event: KeyEvent, device: usize) -> Vec<KeyEvent> {
        let mut output = std::mem::take(&mut self.spare_buffer);
        if self.should_exit {
            return output;
        }

        match event.state {
            KeyState::Down if event.key == Key::INPUT_TIMEOUT => {
                self.buffer.push(BufferedEvent::new(event, device));
                let timeout = self.drive_matching(&mut output);
                self.finish_update(timeout, &mut output);
            }
            KeyState::Down => {
                if self.is_repeat(event.key) {
                    // Held keys autorepeat on the virtual device; a second
                    // Down must not re-drive matching.
                    return output;
                }
                self.note_key_down(event.key);
                self.buffer.push(BufferedEvent::new(event, device));
                let timeout = self.drive_matching(&mut output);
                self.finish_update(timeout, &mut output);
            }
            KeyState::Up => {
                self.note_key_up(event.key);
                if self
                    .buffer
                    .iter()
                    .any(|e| e.is_context() && e.event.key == event.key)
                {
                    self.buffer
                        .retain(|e| !(e.is_context() && e.event.key == event.key));
                    self.release_outputs(event.key, &mut output);
                } else {
                    self.buffer.push(BufferedEvent::new(event, device));
                    let timeout = self.drive_matching(&mut output);
                    self.finish_update(timeout, &mut output);
                }
            }
            _ => {
                log::warn!("dropping input event with invalid state: {}", event);
            }
        }
        output
    }

    /// Forward still-buffered modifiers, then arm a pending input timeout
    /// as the last output event.
    fn finish_update(&mut self, timeout_request: Option<u16>, output: &mut Vec<KeyEvent>) {
        self.forward_pending_modifiers(output);
        if let Some(timeout) = timeout_request {
            output.push(KeyEvent {
                key: Key::INPUT_TIMEOUT,
                state: KeyState::Down,
                timeout,
            });
        }
    }

    /// A Down is a repeat when the key's last buffered occurrence is still
    /// down (fresh or already matched). Device index is irrelevant.
    fn is_repeat(&self, key: Key) -> bool {
        self.buffer
            .iter()
            .rev()
            .find(|e| e.event.key == key)
            .is_some_and(|e| {
                matches!(e.event.state, KeyState::Down | KeyState::DownMatched)
            })
    }

    fn note_key_down(&mut self, key: Key) {
        if key.is_virtual() {
            if !self.toggled_virtual_keys.contains(&key) {
                self.toggled_virtual_keys.push(key);
            }
        } else if key.is_physical() && !self.keys_down.contains(&key) {
            self.keys_down.push(key);
        }
    }

    fn note_key_up(&mut self, key: Key) {
        if key.is_virtual() {
            self.toggled_virtual_keys.retain(|k| *k != key);
        } else {
            self.keys_down.retain(|k| *k != key);
        }
    }

    fn input_key_down(&self, key: Key) -> bool {
        if key.is_virtual() {
            self.toggled_virtual_keys.contains(&key)
        } else {
            self.keys_down.contains(&key)
        }
    }

    /// Run the match loop until a pattern is still viable, or the buffer
    /// holds nothing but retained context. Returns a pending timeout
    /// request when a pattern is waiting on a `timeout` element.
    fn drive_matching(&mut self, output: &mut Vec<KeyEvent>) -> Option<u16> {
        loop {
            if !self.buffer.iter().any(|e| !e.is_context()) {
                return None;
            }
            let search = self.search_candidates();
            if search.might_match {
                // Greedy longest match: while any pattern might still grow,
                // even a complete shorter match stays unapplied.
                return search.timeout_request;
            }
            match search.best {
                Some((candidate, state)) => self.apply_match(candidate, &state, output),
                None => self.flush_first_fresh(output),
            }
            if self.should_exit {
                return None;
            }
        }
    }

    /// Match every eligible mapping (and the exit sequence) against the
    /// buffer, keeping the longest complete match and noting viability.
    fn search_candidates(&self) -> Search {
        let mut search = Search::default();
        let device = self
            .buffer
            .iter()
            .rev()
            .find(|e| !e.is_context())
            .map(|e| e.device)
            .unwrap_or(NO_DEVICE);

        let matcher = Matcher::new(&self.config.logical_keys);
        let keys_down = &self.keys_down;
        let toggled = &self.toggled_virtual_keys;
        let input_down = |key: Key| {
            if key.is_virtual() {
                toggled.contains(&key)
            } else {
                keys_down.contains(&key)
            }
        };
        let mut state = MatchState::default();

        for (context_index, context) in self.config.contexts.iter().enumerate() {
            if !self.context_applies(context_index, device) {
                continue;
            }
            for (mapping_index, mapping) in context.mappings.iter().enumerate() {
                match matcher.match_sequence(&mapping.input, &self.buffer, &input_down, &mut state)
                {
                    MatchResult::Match if state.consumed_fresh => {
                        let better = search
                            .best
                            .as_ref()
                            .is_none_or(|(_, best)| state.consumed > best.consumed);
                        if better {
                            search.best = Some((
                                Candidate::Mapping {
                                    context: context_index,
                                    mapping: mapping_index,
                                },
                                state.clone(),
                            ));
                        }
                    }
                    MatchResult::MightMatch => {
                        search.might_match = true;
                        if let Some(timeout) = state.timeout_request {
                            search.timeout_request = Some(
                                search
                                    .timeout_request
                                    .map_or(timeout, |current| current.min(timeout)),
                            );
                        }
                    }
                    _ => {}
                }
            }
            if !context.fallthrough {
                // First matching non-fallthrough context ends the search,
                // even when none of its mappings matched.
                break;
            }
        }

        if !self.config.exit_sequence.is_empty() {
            match matcher.match_sequence(
                &self.config.exit_sequence,
                &self.buffer,
                &input_down,
                &mut state,
            ) {
                MatchResult::Match if state.consumed_fresh => {
                    // Same length competition as the mappings; lowest
                    // precedence means mappings win ties, not that a longer
                    // exit match is dropped.
                    let better = search
                        .best
                        .as_ref()
                        .is_none_or(|(_, best)| state.consumed > best.consumed);
                    if better {
                        search.best = Some((Candidate::Exit, state.clone()));
                    }
                }
                MatchResult::MightMatch => search.might_match = true,
                _ => {}
            }
        }

        search
    }

    /// Focus, device and modifier filters must all hold. The modifier
    /// filter is evaluated against the keys held on the output side plus
    /// toggled virtual keys.
    fn context_applies(&self, index: usize, device: usize) -> bool {
        if !self.focus_active.get(index).copied().unwrap_or(false) {
            return false;
        }
        if let Some(matches) = &self.device_matches[index] {
            if matches.is_empty() {
                return false;
            }
            if device != NO_DEVICE && !matches.contains(&device) {
                return false;
            }
        }
        let context = &self.config.contexts[index];
        if let Some(filter) = &context.filter.modifier {
            let output_down = &self.output_down;
            let toggled = &self.toggled_virtual_keys;
            let held = |key: Key| {
                if key.is_virtual() {
                    toggled.contains(&key)
                } else {
                    output_down.iter().any(|o| o.key == key)
                }
            };
            if !self.config.modifier_filter_matches(filter, held) {
                return false;
            }
        }
        true
    }

    /// Resolve the output sequence of a matched mapping. Command outputs
    /// take the first definition among the currently applicable contexts.
    fn resolve_output(&self, candidate: Candidate, device: usize) -> KeySequence {
        let Candidate::Mapping { context, mapping } = candidate else {
            return KeySequence::new();
        };
        match &self.config.contexts[context].mappings[mapping].output {
            MappingOutput::Sequence(sequence) => sequence.clone(),
            MappingOutput::Command(command) => {
                for (index, context) in self.config.contexts.iter().enumerate() {
                    if !self.context_applies(index, device) {
                        continue;
                    }
                    if let Some((_, sequence)) = context
                        .command_outputs
                        .iter()
                        .find(|(c, _)| c == command)
                    {
                        return sequence.clone();
                    }
                }
                log::warn!(
                    "command '{}' has no output in any active context",
                    self.config
                        .command_names
                        .get(*command)
                        .map(String::as_str)
                        .unwrap_or("?")
                );
                KeySequence::new()
            }
        }
    }

    fn resolve_output_key(&self, key: Key, state: &MatchState, any_cursor: &mut usize) -> Key {
        if key == Key::ANY {
            let resolved = state.any_keys.get(*any_cursor).copied().unwrap_or(Key::NONE);
            *any_cursor += 1;
            return resolved;
        }
        match state.bound_side(key) {
            Some(side) => side,
            None => self.config.resolve_logical(key, LogicalSide::Left),
        }
    }

    /// Apply a completed match: suppress consumed forwarded modifiers, emit
    /// the mapped output, rewrite the consumed buffer prefix to retained
    /// context, and release immediately if the trigger is already up.
    fn apply_match(&mut self, candidate: Candidate, state: &MatchState, output: &mut Vec<KeyEvent>) {
        let device = self
            .buffer
            .iter()
            .rev()
            .find(|e| !e.is_context())
            .map(|e| e.device)
            .unwrap_or(NO_DEVICE);

        if matches!(candidate, Candidate::Exit) {
            log::debug!("exit sequence matched");
            self.should_exit = true;
            self.consume_prefix(state);
            return;
        }

        let sequence = self.resolve_output(candidate, device);
        let trigger = state
            .matched
            .iter()
            .rev()
            .map(|&i| self.buffer[i].event)
            .find(|e| {
                matches!(e.state, KeyState::Down | KeyState::DownMatched) && !e.key.is_marker()
            })
            .map(|e| e.key)
            .unwrap_or(Key::NONE);

        // Keys the output presses itself; their forwarded Downs are kept
        // instead of being released and immediately re-pressed.
        let mut any_cursor = 0;
        let output_presses: SmallVec<[Key; 4]> = sequence
            .iter()
            .filter(|e| e.state == KeyState::Down)
            .map(|e| self.resolve_output_key(e.key, state, &mut any_cursor))
            .collect();

        // Consumed modifiers that were already forwarded are taken back up
        // before the mapped output and restored on trigger release.
        for &index in &state.matched {
            let entry = self.buffer[index];
            if !entry.forwarded
                || !matches!(entry.event.state, KeyState::Down | KeyState::DownMatched)
            {
                continue;
            }
            let key = entry.event.key;
            if output_presses.contains(&key) {
                continue;
            }
            if let Some(held) = self
                .output_down
                .iter()
                .rposition(|o| o.key == key && o.trigger == key)
            {
                self.emit_up_index(output, held, KeyState::UpAsync);
                self.restore_on_release.push((trigger, key));
            }
        }

        let mut any_cursor = 0;
        for event in &sequence {
            if event.key == Key::TIMEOUT {
                output.push(*event);
                continue;
            }
            let key = self.resolve_output_key(event.key, state, &mut any_cursor);
            if key == Key::NONE {
                continue;
            }
            match event.state {
                KeyState::Down => self.emit_down(output, key, trigger),
                KeyState::Up | KeyState::UpAsync => self.emit_up(output, key, KeyState::Up),
                KeyState::Not => {
                    // Momentary release, restored when the trigger goes up.
                    while let Some(index) =
                        self.output_down.iter().rposition(|o| o.key == key)
                    {
                        self.emit_up_index(output, index, KeyState::Up);
                    }
                    self.restore_on_release.push((trigger, key));
                }
                KeyState::DownMatched => {}
            }
        }

        self.consume_prefix(state);

        if trigger != Key::NONE && !self.input_key_down(trigger) {
            // Trigger was already released within the matched prefix.
            self.release_outputs(trigger, output);
        }
    }

    /// Rewrite the consumed buffer prefix: matched Downs of still-held keys
    /// become retained context, everything else consumed is dropped, and
    /// skipped context entries stay as they were.
    fn consume_prefix(&mut self, state: &MatchState) {
        let mut retained: Vec<BufferedEvent> = Vec::new();
        for index in 0..state.consumed {
            let entry = self.buffer[index];
            if !state.matched.contains(&index) {
                retained.push(entry);
                continue;
            }
            if matches!(entry.event.state, KeyState::Down | KeyState::DownMatched)
                && !entry.event.key.is_marker()
                && self.input_key_down(entry.event.key)
                // A tap-then-hold pattern consumes the same key twice; one
                // context entry per key is enough.
                && !retained.iter().any(|e| e.event.key == entry.event.key)
            {
                let mut kept = entry;
                kept.event.state = KeyState::DownMatched;
                retained.push(kept);
            }
        }
        self.buffer.splice(0..state.consumed, retained);
    }

    /// Forward buffered modifier events eagerly so OS modifier state stays
    /// responsive while a pattern prefix is pending. Ups pair with the
    /// forwarded passthrough hold; both stay buffered for matching.
    fn forward_pending_modifiers(&mut self, output: &mut Vec<KeyEvent>) {
        for index in 0..self.buffer.len() {
            let entry = self.buffer[index];
            if entry.forwarded || !entry.event.key.is_modifier() {
                continue;
            }
            let key = entry.event.key;
            match entry.event.state {
                KeyState::Down => {
                    self.emit_down(output, key, key);
                    self.buffer[index].forwarded = true;
                }
                KeyState::Up => {
                    if let Some(held) = self
                        .output_down
                        .iter()
                        .rposition(|o| o.key == key && o.trigger == key)
                    {
                        self.emit_up_index(output, held, KeyState::Up);
                    }
                    self.buffer[index].forwarded = true;
                }
                _ => {}
            }
        }
    }

    /// No pattern wants the first fresh event: pass it through.
    fn flush_first_fresh(&mut self, output: &mut Vec<KeyEvent>) {
        let Some(pos) = self.buffer.iter().position(|e| !e.is_context()) else {
            return;
        };
        let entry = self.buffer[pos];
        let event = entry.event;
        match event.state {
            KeyState::Down if event.key.is_marker() => {
                // Stale input-timeout events are dropped silently.
                self.buffer.remove(pos);
            }
            KeyState::Down if event.key.is_virtual() => {
                // Toggled virtual keys are pure state; keep as context.
                self.buffer[pos].event.state = KeyState::DownMatched;
            }
            KeyState::Down => {
                if !entry.forwarded {
                    self.emit_down(output, event.key, event.key);
                }
                let has_pending_up = self.buffer[pos + 1..]
                    .iter()
                    .any(|e| e.event.state == KeyState::Up && e.event.key == event.key);
                if !has_pending_up && self.input_key_down(event.key) {
                    self.buffer[pos].event.state = KeyState::DownMatched;
                } else {
                    // Already released; the matching Up is still queued.
                    self.buffer.remove(pos);
                }
            }
            KeyState::Up => {
                self.buffer.remove(pos);
                if !entry.forwarded {
                    self.emit_up(output, event.key, KeyState::Up);
                }
            }
            _ => {
                self.buffer.remove(pos);
            }
        }
    }

    /// Release everything held for `trigger` (reverse order), then restore
    /// modifiers that were temporarily taken up for its match.
    fn release_outputs(&mut self, trigger: Key, output: &mut Vec<KeyEvent>) {
        while let Some(index) = self.output_down.iter().rposition(|o| o.trigger == trigger) {
            self.emit_up_index(output, index, KeyState::Up);
        }
        let mut restored: SmallVec<[Key; 2]> = SmallVec::new();
        self.restore_on_release.retain(|(t, key)| {
            if *t == trigger {
                restored.push(*key);
                false
            } else {
                true
            }
        });
        for key in restored {
            if self.input_key_down(key) && !self.output_down.iter().any(|o| o.key == key) {
                self.emit_down(output, key, key);
            }
        }
    }

    /// Canonicalized Down emission: action and virtual Downs pass through
    /// as tokens, physical Downs are tracked and deduplicated.
    fn emit_down(&mut self, output: &mut Vec<KeyEvent>, key: Key, trigger: Key) {
        if key.is_action() || key.is_virtual() {
            output.push(KeyEvent::down(key));
            return;
        }
        if !key.is_physical() {
            log::warn!("dropping non-physical output key {}", key);
            return;
        }
        let already_down = self.output_down.iter().any(|o| o.key == key);
        self.output_down.push(OutputDown { key, trigger });
        if !already_down {
            output.push(KeyEvent::down(key));
        }
    }

    /// Canonicalized Up emission: suppressed for action/virtual keys, for
    /// keys not down, and while another holder keeps the key down.
    fn emit_up(&mut self, output: &mut Vec<KeyEvent>, key: Key, state: KeyState) {
        if key.is_action() || key.is_virtual() {
            return;
        }
        match self.output_down.iter().rposition(|o| o.key == key) {
            Some(index) => self.emit_up_index(output, index, state),
            None => log::debug!("dropping release of {} which is not down", key),
        }
    }

    fn emit_up_index(&mut self, output: &mut Vec<KeyEvent>, index: usize, state: KeyState) {
        let entry = self.output_down.remove(index);
        if !self.output_down.iter().any(|o| o.key == entry.key) {
            output.push(KeyEvent::new(entry.key, state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::event::format_sequence;

    fn stage_from(toml: &str) -> Stage {
        Stage::new(parse_config(toml).unwrap())
    }

    fn feed(stage: &mut Stage, events: &[KeyEvent]) -> String {
        let mut all = Vec::new();
        for event in events {
            let out = stage.update(*event, 0);
            all.extend_from_slice(&out);
            stage.reuse_buffer(out);
        }
        format_sequence(&all)
    }

    #[test]
    fn test_simple_remap() {
        let mut stage = stage_from(
            r#"
            [[context]]
            mappings = [["A", "B"]]
            "#,
        );
        let out = feed(
            &mut stage,
            &[KeyEvent::down(Key::A), KeyEvent::up(Key::A)],
        );
        assert_eq!(out, "+B -B");
        assert!(!stage.is_output_down());
    }

    #[test]
    fn test_passthrough_preserves_order() {
        let mut stage = stage_from(
            r#"
            [[context]]
            mappings = [["A", "B"]]
            "#,
        );
        let out = feed(
            &mut stage,
            &[
                KeyEvent::down(Key::Z),
                KeyEvent::down(Key::X),
                KeyEvent::up(Key::Z),
                KeyEvent::up(Key::X),
            ],
        );
        assert_eq!(out, "+Z +X -Z -X");
    }

    #[test]
    fn test_exit_sequence_latches() {
        let mut stage = stage_from(r#"exit_sequence = "LEFT_CTRL-Q""#);
        assert!(!stage.should_exit());
        feed(
            &mut stage,
            &[KeyEvent::down(Key::LEFT_CTRL), KeyEvent::down(Key::physical(16))],
        );
        assert!(stage.should_exit());
        // Latched: further updates are no-ops.
        let out = stage.update(KeyEvent::down(Key::A), 0);
        assert!(out.is_empty());
        assert!(stage.should_exit());
    }

    #[test]
    fn test_set_active_contexts_is_idempotent() {
        let mut stage = stage_from(
            r#"
            [[context]]
            class = "editor"
            mappings = [["A", "B"]]
            "#,
        );
        stage.set_active_contexts(&[0]);
        let first = stage.focus_active.clone();
        stage.set_active_contexts(&[0]);
        assert_eq!(stage.focus_active, first);
    }

    #[test]
    fn test_device_filter_evaluation() {
        let mut stage = stage_from(
            r#"
            [[context]]
            device = "trackball"
            mappings = [["A", "B"]]
            "#,
        );
        // Unevaluated device filter leaves the context inactive.
        let out = feed(&mut stage, &[KeyEvent::down(Key::A), KeyEvent::up(Key::A)]);
        assert_eq!(out, "+A -A");

        stage.evaluate_device_filters(&["Kensington Trackball".to_string()]);
        let out = feed(&mut stage, &[KeyEvent::down(Key::A), KeyEvent::up(Key::A)]);
        assert_eq!(out, "+B -B");
    }

    #[test]
    fn test_invalid_up_is_dropped() {
        let mut stage = stage_from(
            r#"
            [[context]]
            mappings = [["A", "B"]]
            "#,
        );
        let out = feed(&mut stage, &[KeyEvent::up(Key::Z)]);
        assert_eq!(out, "");
    }
}
