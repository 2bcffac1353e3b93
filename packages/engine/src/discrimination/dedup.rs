// packages/engine/src/discrimination/dedup.rs
//! Counting deduplication of scenes
//!
//! Counts how often each fingerprint has been seen per session type and keeps
//! a session only while its count stays within the matcher's threshold.
//! Counts are never decayed; dropping the state is the only reset.

use std::collections::HashMap;

/// Result of observing one fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// Count is within the threshold
    Keep { count: u64 },

    /// Count exceeded the threshold
    Drop { count: u64 },
}

impl DedupDecision {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep { .. })
    }
}

/// Per session type, per fingerprint occurrence counts
#[derive(Debug, Default)]
pub struct DeduplicationState {
    session_types: HashMap<String, HashMap<Vec<u8>, u64>>,
}

impl DeduplicationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence and decide against `keep_n`
    pub fn observe(&mut self, session_type: &str, fingerprint: Vec<u8>, keep_n: u64) -> DedupDecision {
        let per_type = match self.session_types.get_mut(session_type) {
            Some(per_type) => per_type,
            None => self
                .session_types
                .entry(session_type.to_string())
                .or_default(),
        };
        let count = per_type.entry(fingerprint).or_insert(0);
        *count += 1;

        if *count > keep_n {
            DedupDecision::Drop { count: *count }
        } else {
            DedupDecision::Keep { count: *count }
        }
    }

    /// Occurrences recorded so far
    pub fn count(&self, session_type: &str, fingerprint: &[u8]) -> u64 {
        self.session_types
            .get(session_type)
            .and_then(|per_type| per_type.get(fingerprint))
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct fingerprints tracked across all session types
    pub fn fingerprints(&self) -> usize {
        self.session_types.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_until_threshold() {
        let mut state = DeduplicationState::new();

        assert_eq!(state.observe("/a", b"fp".to_vec(), 2), DedupDecision::Keep { count: 1 });
        assert_eq!(state.observe("/a", b"fp".to_vec(), 2), DedupDecision::Keep { count: 2 });
        assert_eq!(state.observe("/a", b"fp".to_vec(), 2), DedupDecision::Drop { count: 3 });
        assert_eq!(state.count("/a", b"fp"), 3);
    }

    #[test]
    fn test_session_types_are_independent() {
        let mut state = DeduplicationState::new();

        assert!(state.observe("/a", b"fp".to_vec(), 1).is_keep());
        assert!(state.observe("/b", b"fp".to_vec(), 1).is_keep());
        assert!(!state.observe("/a", b"fp".to_vec(), 1).is_keep());
        assert_eq!(state.fingerprints(), 2);
    }

    #[test]
    fn test_zero_threshold_drops_everything() {
        let mut state = DeduplicationState::new();
        assert!(!state.observe("/a", Vec::new(), 0).is_keep());
    }
}
