//! Per-`(type, name)` round-robin cursors for load-balancing across
//! multi-address answer sets.

use crate::enums::RecordType;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    next_v4: u8,
    next_v6: u8,
}

/// Holds one cursor pair per `(record type, lowered name)`, serialized
/// behind a single `RwLock` as the data model's single-writer discipline
/// requires.
#[derive(Default)]
pub struct RoundRobinState {
    cursors: RwLock<HashMap<(RecordType, String), Cursor>>,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next index into a `len`-long answer list for `(record_type,
    /// name)` and advances the cursor. Returns 0 for an empty list.
    pub fn next_index(&self, record_type: RecordType, name: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let key = (record_type, name.to_ascii_lowercase());
        let mut cursors = self.cursors.write().expect("round robin lock poisoned");
        let cursor = cursors.entry(key).or_default();
        let field = match record_type {
            RecordType::AAAA => &mut cursor.next_v6,
            _ => &mut cursor.next_v4,
        };
        let current = *field as usize % len;
        *field = ((current + 1) % len) as u8;
        current
    }

    /// Drops all cursors, for use on zone reload per the lifecycle contract.
    pub fn reset(&self) {
        self.cursors
            .write()
            .expect("round robin lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_modulo_length() {
        let state = RoundRobinState::new();
        assert_eq!(state.next_index(RecordType::A, "example.com", 3), 0);
        assert_eq!(state.next_index(RecordType::A, "example.com", 3), 1);
        assert_eq!(state.next_index(RecordType::A, "example.com", 3), 2);
        assert_eq!(state.next_index(RecordType::A, "example.com", 3), 0);
    }

    #[test]
    fn v4_and_v6_cursors_are_independent() {
        let state = RoundRobinState::new();
        assert_eq!(state.next_index(RecordType::A, "example.com", 2), 0);
        assert_eq!(state.next_index(RecordType::AAAA, "example.com", 2), 0);
        assert_eq!(state.next_index(RecordType::A, "example.com", 2), 1);
        assert_eq!(state.next_index(RecordType::AAAA, "example.com", 2), 1);
    }

    #[test]
    fn reset_clears_cursors() {
        let state = RoundRobinState::new();
        state.next_index(RecordType::A, "example.com", 3);
        state.reset();
        assert_eq!(state.next_index(RecordType::A, "example.com", 3), 0);
    }
}
