// Remapd Sequence Matcher
// Greedy prefix matching of key-event patterns against the input buffer

use smallvec::SmallVec;

use crate::config::LogicalKey;
use crate::event::{KeyEvent, KeyState};
use crate::Key;

/// Device index for synthetic events (virtual-key injection, input
/// timeouts); matches every context's device filter.
pub const NO_DEVICE: usize = usize::MAX;

/// An input event buffered by the stage, annotated with its source device
/// and whether it has already been forwarded to the output.
#[derive(Debug, Clone, Copy)]
pub struct BufferedEvent {
    pub event: KeyEvent,
    pub device: usize,
    pub forwarded: bool,
}

impl BufferedEvent {
    pub fn new(event: KeyEvent, device: usize) -> Self {
        Self {
            event,
            device,
            forwarded: false,
        }
    }

    /// Context entries are Downs retained from earlier matches; they are
    /// skippable during matching and never re-fire on their own.
    pub fn is_context(&self) -> bool {
        self.event.state == KeyState::DownMatched
    }
}

/// Result of matching one pattern against the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The pattern is satisfied by a buffer prefix.
    Match,
    /// The pattern could still match given more input.
    MightMatch,
    /// The pattern can no longer match this buffer.
    NoMatch,
}

/// Side data produced while matching: the consumed prefix length, logical
/// side bindings, `Any` bindings and a pending timeout request.
#[derive(Debug, Default, Clone)]
pub struct MatchState {
    /// Buffer prefix length covered by the match (context entries included).
    pub consumed: usize,
    /// True when at least one non-context event was consumed; a match that
    /// only re-reads retained context must not fire again.
    pub consumed_fresh: bool,
    /// Buffer positions consumed by pattern elements. Context entries the
    /// matcher merely stepped over are not listed.
    pub matched: SmallVec<[usize; 8]>,
    /// Logical `both` identity -> the physical side that matched.
    pub binding: SmallVec<[(Key, Key); 2]>,
    /// Keys matched by `Any` elements, in order.
    pub any_keys: SmallVec<[Key; 2]>,
    /// Set when the pattern is waiting on a `timeout` element.
    pub timeout_request: Option<u16>,
}

impl MatchState {
    fn reset(&mut self) {
        self.consumed = 0;
        self.consumed_fresh = false;
        self.matched.clear();
        self.binding.clear();
        self.any_keys.clear();
        self.timeout_request = None;
    }

    pub fn bound_side(&self, both: Key) -> Option<Key> {
        self.binding
            .iter()
            .find(|(b, _)| *b == both)
            .map(|(_, side)| *side)
    }
}

/// Matches patterns against the stage's input buffer.
///
/// Pattern elements act as predicates: `Down` consumes a fresh or retained
/// Down, `Up` the corresponding Up, `UpAsync` an Up that may arrive late or
/// early, `Not` and `DownMatched` probe the held-key state, and `timeout`
/// awaits an input-timeout event. Logical keys match either physical side
/// and stay bound to it for the rest of the pattern.
pub struct Matcher<'a> {
    logical_keys: &'a [LogicalKey],
}

impl<'a> Matcher<'a> {
    pub fn new(logical_keys: &'a [LogicalKey]) -> Self {
        Self { logical_keys }
    }

    fn logical_entry(&self, key: Key) -> Option<&LogicalKey> {
        key.logical_index().and_then(|i| self.logical_keys.get(i))
    }

    /// Test a pattern key against a buffer key, extending the logical/Any
    /// bindings on success.
    fn key_matches(&self, pattern_key: Key, event_key: Key, state: &mut MatchState) -> bool {
        if pattern_key == Key::ANY {
            state.any_keys.push(event_key);
            return true;
        }
        if pattern_key == event_key {
            return true;
        }
        if let Some(entry) = self.logical_entry(pattern_key) {
            if let Some(side) = state.bound_side(pattern_key) {
                return side == event_key;
            }
            if entry.left == event_key || entry.right == event_key {
                state.binding.push((pattern_key, event_key));
                return true;
            }
        }
        false
    }

    /// Like `key_matches` but for release events: `Any` releases bind to a
    /// previously matched `Any` key instead of matching anything.
    fn release_matches(&self, pattern_key: Key, event_key: Key, state: &mut MatchState) -> bool {
        if pattern_key == Key::ANY {
            if let Some(pos) = state.any_keys.iter().position(|k| *k == event_key) {
                state.any_keys.remove(pos);
                return true;
            }
            return false;
        }
        if pattern_key == event_key {
            return true;
        }
        if let Some(entry) = self.logical_entry(pattern_key) {
            return match state.bound_side(pattern_key) {
                Some(side) => side == event_key,
                None => entry.left == event_key || entry.right == event_key,
            };
        }
        false
    }

    fn is_down_resolved(
        &self,
        key: Key,
        state: &MatchState,
        is_down: &dyn Fn(Key) -> bool,
    ) -> bool {
        if let Some(side) = state.bound_side(key) {
            return is_down(side);
        }
        match self.logical_entry(key) {
            Some(entry) => is_down(entry.left) || is_down(entry.right),
            None => is_down(key),
        }
    }

    /// Match `pattern` against a prefix of `buffer`.
    ///
    /// `is_down` reports whether a physical or virtual key is currently
    /// held. On `Match`, `state.consumed` is the covered prefix length.
    pub fn match_sequence(
        &self,
        pattern: &[KeyEvent],
        buffer: &[BufferedEvent],
        is_down: &dyn Fn(Key) -> bool,
        state: &mut MatchState,
    ) -> MatchResult {
        state.reset();
        // Pattern elements satisfied out of order by early releases.
        let mut satisfied: SmallVec<[bool; 8]> = SmallVec::new();
        satisfied.resize(pattern.len(), false);

        let mut p = 0;
        let mut b = 0;

        loop {
            while p < pattern.len() && satisfied[p] {
                p += 1;
            }
            if p == pattern.len() {
                state.consumed = b;
                return MatchResult::Match;
            }
            let element = pattern[p];

            // `None` is a no-op separator.
            if element.key == Key::NONE {
                p += 1;
                continue;
            }

            // Negative predicate: does not consume input.
            if element.state == KeyState::Not {
                if self.is_down_resolved(element.key, state, is_down) {
                    return MatchResult::NoMatch;
                }
                p += 1;
                continue;
            }

            // Timeout element: wait for the driver-delivered quiet-period
            // event carrying at least the requested duration.
            if element.key == Key::TIMEOUT {
                if b == buffer.len() {
                    state.timeout_request = Some(element.timeout);
                    return MatchResult::MightMatch;
                }
                let event = buffer[b].event;
                if event.key == Key::INPUT_TIMEOUT && event.timeout >= element.timeout {
                    state.matched.push(b);
                    state.consumed_fresh = true;
                    b += 1;
                    p += 1;
                    continue;
                }
                return MatchResult::NoMatch;
            }

            // "Already down" probes the held state and consumes a matching
            // retained context entry when one is next, but never blocks on
            // unrelated buffer events.
            if element.state == KeyState::DownMatched {
                if !self.is_down_resolved(element.key, state, is_down) {
                    return MatchResult::NoMatch;
                }
                if b < buffer.len()
                    && buffer[b].event.state == KeyState::DownMatched
                    && self.key_matches(element.key, buffer[b].event.key, state)
                {
                    state.matched.push(b);
                    b += 1;
                }
                p += 1;
                continue;
            }

            match element.state {
                KeyState::Down => {
                    if b == buffer.len() {
                        return MatchResult::MightMatch;
                    }
                    let buffered = buffer[b];
                    let event = buffered.event;
                    match event.state {
                        KeyState::Down | KeyState::DownMatched
                            if self.key_matches(element.key, event.key, state) =>
                        {
                            if event.state == KeyState::Down {
                                state.consumed_fresh = true;
                            }
                            state.matched.push(b);
                            b += 1;
                            p += 1;
                        }
                        KeyState::DownMatched => {
                            // Unrelated retained context is skippable.
                            b += 1;
                        }
                        KeyState::Up => {
                            // A release arriving before its pattern position:
                            // consume it if a later element expects it.
                            match self.find_pending_release(
                                pattern, p, &satisfied, event.key, state,
                            ) {
                                Some(j) => {
                                    satisfied[j] = true;
                                    state.consumed_fresh = true;
                                    state.matched.push(b);
                                    b += 1;
                                }
                                None => return MatchResult::NoMatch,
                            }
                        }
                        _ => return MatchResult::NoMatch,
                    }
                }
                KeyState::Up => {
                    if b == buffer.len() {
                        return MatchResult::MightMatch;
                    }
                    let event = buffer[b].event;
                    match event.state {
                        KeyState::Up if self.release_matches(element.key, event.key, state) => {
                            state.consumed_fresh = true;
                            state.matched.push(b);
                            b += 1;
                            p += 1;
                        }
                        KeyState::DownMatched => {
                            b += 1;
                        }
                        _ => return MatchResult::NoMatch,
                    }
                }
                KeyState::UpAsync => {
                    if b < buffer.len()
                        && buffer[b].event.state == KeyState::Up
                        && self.release_matches(element.key, buffer[b].event.key, state)
                    {
                        state.consumed_fresh = true;
                        state.matched.push(b);
                        b += 1;
                        p += 1;
                    } else {
                        // The release may arrive later (or not at all
                        // before the match completes).
                        p += 1;
                    }
                }
                KeyState::DownMatched | KeyState::Not => unreachable!(),
            }
        }
    }

    /// Scan the rest of the pattern for an unsatisfied release element
    /// matching `key`.
    fn find_pending_release(
        &self,
        pattern: &[KeyEvent],
        from: usize,
        satisfied: &[bool],
        key: Key,
        state: &mut MatchState,
    ) -> Option<usize> {
        (from + 1..pattern.len()).find(|&j| {
            !satisfied[j]
                && matches!(pattern[j].state, KeyState::Up | KeyState::UpAsync)
                && self.release_matches(pattern[j].key, key, state)
        })
    }
}
