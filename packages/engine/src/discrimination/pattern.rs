// packages/engine/src/discrimination/pattern.rs
//! Compiled groups of named patterns
//!
//! Matching runs in two stages. A [`RegexSet`] scans the input once and
//! reports which keys match at all; only those keys then run their own
//! [`Regex`] to recover spans and the first capturing group. Both stages are
//! built from the same pattern text with the same flags, so they agree on
//! what matches.
//!
//! The compiled engines are immutable and `Sync`; the regex crate keeps
//! per-thread search caches internally, so a group can be shared across
//! discrimination workers without any scratch state of our own.

use crate::utils::errors::{EngineError, Result};
use regex::bytes::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use std::collections::BTreeMap;
use std::fmt;

struct KeyedPattern {
    key: String,
    regex: Regex,
}

/// Immutable bundle of named patterns
pub struct PatternGroup {
    prefilter: RegexSet,
    patterns: Vec<KeyedPattern>,
}

/// One match produced by [`PatternGroup::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch<'a> {
    pub key: &'a str,

    /// Whole matched span
    pub span: &'a [u8],

    /// First capturing group (empty if it did not participate)
    pub value: &'a [u8],

    start: usize,
    pattern: usize,
}

impl PatternGroup {
    /// Compile every pattern; any failure rejects the whole group
    pub fn compile(patterns: &BTreeMap<String, String>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for (key, pattern) in patterns {
            let regex = RegexBuilder::new(pattern)
                .dot_matches_new_line(true)
                .build()
                .map_err(|source| EngineError::PatternCompile {
                    key: key.clone(),
                    source,
                })?;
            if regex.captures_len() < 2 {
                return Err(EngineError::ConfigInvalid(format!(
                    "pattern {:?} for key {:?} has no capturing group",
                    pattern, key
                )));
            }
            compiled.push(KeyedPattern {
                key: key.clone(),
                regex,
            });
        }

        let prefilter = RegexSetBuilder::new(patterns.values())
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| EngineError::ConfigInvalid(format!("pattern set: {}", e)))?;

        Ok(Self {
            prefilter,
            patterns: compiled,
        })
    }

    /// Compile a group, treating an empty map as "no group"
    pub fn compile_optional(patterns: &BTreeMap<String, String>) -> Result<Option<Self>> {
        if patterns.is_empty() {
            return Ok(None);
        }
        Self::compile(patterns).map(Some)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.key.as_str())
    }

    /// All matches of all keys, ordered by start offset then key order.
    ///
    /// Each key reports its left-most-first, non-overlapping matches; matches
    /// of different keys may overlap.
    pub fn find<'a>(&'a self, haystack: &'a [u8]) -> Vec<PatternMatch<'a>> {
        if haystack.is_empty() {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for index in self.prefilter.matches(haystack).iter() {
            let pattern = &self.patterns[index];
            for caps in pattern.regex.captures_iter(haystack) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                matches.push(PatternMatch {
                    key: &pattern.key,
                    span: whole.as_bytes(),
                    value: caps.get(1).map_or(&[][..], |m| m.as_bytes()),
                    start: whole.start(),
                    pattern: index,
                });
            }
        }
        matches.sort_by_key(|m| (m.start, m.pattern));
        matches
    }
}

impl fmt::Debug for PatternGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternGroup")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}
