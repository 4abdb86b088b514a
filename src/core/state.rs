//! Lifecycle states of an iterator.

use std::fmt;

/// The lifecycle state of an iterator.
///
/// States only ever move forward: `Init → Open → Closing → Closed → Ended`,
/// with `Destroyed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum State {
    /// Not started yet
    Init,
    /// Able to produce items
    Open,
    /// A close was requested while a buffer fill was still in flight
    Closing,
    /// No new items will be produced; buffered items may remain
    Closed,
    /// Terminal: all items were read
    Ended,
    /// Terminal: stopped before exhaustion
    Destroyed,
}

impl State {
    /// Whether moving from `self` to `next` is a valid transition.
    pub fn can_become(self, next: State) -> bool {
        next > self && self < State::Ended
    }

    /// Whether no new items will be produced.
    pub fn is_closed(self) -> bool {
        self >= State::Closing
    }

    /// Whether the state is terminal.
    pub fn is_done(self) -> bool {
        self >= State::Ended
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Init => "init",
            State::Open => "open",
            State::Closing => "closing",
            State::Closed => "closed",
            State::Ended => "ended",
            State::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_move_forward() {
        assert!(State::Open.can_become(State::Closed));
        assert!(State::Closed.can_become(State::Ended));
        assert!(State::Init.can_become(State::Destroyed));
        assert!(!State::Open.can_become(State::Open));
        assert!(!State::Closed.can_become(State::Open));
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(!State::Ended.can_become(State::Destroyed));
        assert!(!State::Destroyed.can_become(State::Destroyed));
        assert!(State::Ended.is_done());
        assert!(State::Destroyed.is_done());
        assert!(!State::Closed.is_done());
    }

    #[test]
    fn test_closing_counts_as_closed() {
        assert!(State::Closing.is_closed());
        assert!(!State::Open.is_closed());
    }
}
