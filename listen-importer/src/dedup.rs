//! Lookahead duplicate resolution over a time-ordered stream of listens.
//!
//! Incoming listens are kept in a buffer sorted by `listened_at`. Once the buffer spans
//! more than the configured window, its oldest listen becomes the candidate and is
//! compared against the listens that follow it closely enough in time:
//!
//! 1. exact duplicate (same key): the candidate is dropped
//! 2. tagged duplicate: the listen carrying a dedup tag is dropped
//! 3. same timestamp and track name: the richer listen survives, ties keep the buffered one
//! 4. fuzzy (timestamps within a few seconds) and same track name: same as 3
//!
//! A candidate that wins a comparison stays the candidate and keeps scanning from the
//! slot of the listen it removed. A candidate that survives the whole scan is emitted.
//!
//! Duplicates further apart than the window are never seen together and are not detected.
//!
//! The length cap only releases a listen once the buffer reaches past its skew horizon, so a
//! burst of listens sharing one timestamp can grow the buffer beyond the cap.

use std::collections::VecDeque;
use std::sync::Arc;

use listen_common::listen::Listen;
use tracing::trace;

use crate::error::ConfigError;
use crate::stats::{DuplicateKind, ImportStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupConfig {
    /// Maximum span in seconds between the oldest and newest buffered listen.
    pub window_seconds: i64,
    /// A candidate is only compared with listens at most this many seconds younger.
    pub skew_bound: i64,
    /// Maximum distance in seconds for two listens to be fuzzy duplicates.
    pub fuzzy_bound: i64,
    /// Listens older than this are rejected outright.
    pub min_valid_timestamp: i64,
    /// Cap on buffered listens, for streams with very dense timestamps. Listens within the
    /// skew bound of the oldest one are kept regardless.
    pub max_buffer_len: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            skew_bound: 5,
            fuzzy_bound: 2,
            min_valid_timestamp: 1,
            max_buffer_len: 100000,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fuzzy_bound < 0 || self.skew_bound < 0 || self.window_seconds < 0 {
            return Err(ConfigError::Invalid("dedup bounds must not be negative"));
        }
        if self.fuzzy_bound > self.skew_bound {
            return Err(ConfigError::Invalid("FUZZY_BOUND must not exceed SKEW_BOUND"));
        }
        if self.skew_bound > self.window_seconds {
            return Err(ConfigError::Invalid("SKEW_BOUND must not exceed WINDOW_SECONDS"));
        }
        if self.max_buffer_len == 0 {
            return Err(ConfigError::Invalid("MAX_BUFFER_LEN must be at least 1"));
        }
        Ok(())
    }
}

/// Outcome of comparing the candidate with one buffered listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Not a duplicate, keep scanning.
    Distinct,
    /// The candidate is a duplicate of the buffered listen and is dropped.
    DropCandidate(DuplicateKind),
    /// The buffered listen is a duplicate of the candidate and is removed.
    DropBuffered(DuplicateKind),
}

pub struct Deduplicator {
    config: DedupConfig,
    buffer: VecDeque<Listen>,
    stats: Arc<ImportStats>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig, stats: Arc<ImportStats>) -> Self {
        Self {
            config,
            buffer: VecDeque::new(),
            stats,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Admit one sanitized listen. Listens that become final are appended to `out`.
    pub fn push(&mut self, listen: Listen, out: &mut Vec<Listen>) {
        if let Err(error) = listen.validate(self.config.min_valid_timestamp) {
            trace!("dropping listen: {}", error);
            self.stats.record_invalid_timestamp();
            return;
        }

        // Insert after any listen with the same timestamp to keep arrival order stable.
        let position = self
            .buffer
            .partition_point(|buffered| buffered.listened_at <= listen.listened_at);
        self.buffer.insert(position, listen);

        while self.is_full() {
            self.resolve_next(out);
        }
    }

    /// Input is exhausted: resolve everything still buffered.
    pub fn finish(&mut self, out: &mut Vec<Listen>) {
        while !self.buffer.is_empty() {
            self.resolve_next(out);
        }
    }

    fn is_full(&self) -> bool {
        let span = match (self.buffer.front(), self.buffer.back()) {
            (Some(oldest), Some(newest)) => newest.listened_at.saturating_sub(oldest.listened_at),
            _ => return false,
        };
        if span > self.config.window_seconds {
            return true;
        }
        // Everything the oldest listen will be compared with must already be buffered.
        self.buffer.len() > self.config.max_buffer_len && span > self.config.skew_bound
    }

    /// One resolution step: take the oldest listen and either emit or drop it.
    fn resolve_next(&mut self, out: &mut Vec<Listen>) {
        let Some(candidate) = self.buffer.pop_front() else {
            return;
        };
        let horizon = candidate.listened_at.saturating_add(self.config.skew_bound);

        let mut index = 0;
        while index < self.buffer.len() {
            let buffered = &self.buffer[index];
            if buffered.listened_at > horizon {
                break;
            }

            match self.compare(&candidate, buffered) {
                Verdict::Distinct => index += 1,
                Verdict::DropCandidate(kind) => {
                    trace!(
                        listened_at = candidate.listened_at,
                        user_name = candidate.user_name.as_str(),
                        "dropping {} duplicate",
                        kind.as_str()
                    );
                    self.stats.record_duplicate(kind);
                    return;
                }
                Verdict::DropBuffered(kind) => {
                    // The next listen slides into `index`, so the scan resumes right there.
                    self.buffer.remove(index);
                    self.stats.record_duplicate(kind);
                }
            }
        }

        self.stats.record_unique();
        out.push(candidate);
    }

    /// Rules are tried in order and the first match wins.
    fn compare(&self, candidate: &Listen, buffered: &Listen) -> Verdict {
        if candidate.key() == buffered.key() {
            return Verdict::DropCandidate(DuplicateKind::Exact);
        }

        if candidate.user_name != buffered.user_name || !candidate.same_track_name(buffered) {
            return Verdict::Distinct;
        }

        let same_timestamp = candidate.listened_at == buffered.listened_at;
        let candidate_tagged = candidate.is_dedup_tagged();
        let buffered_tagged = buffered.is_dedup_tagged();

        if same_timestamp && candidate_tagged != buffered_tagged {
            return if buffered_tagged {
                Verdict::DropBuffered(DuplicateKind::Tagged)
            } else {
                Verdict::DropCandidate(DuplicateKind::Tagged)
            };
        }

        if same_timestamp && !candidate_tagged && !buffered_tagged {
            return keep_richer(candidate, buffered, DuplicateKind::SameTimestampName);
        }

        if candidate.listened_at.abs_diff(buffered.listened_at) <= self.config.fuzzy_bound as u64 {
            return keep_richer(candidate, buffered, DuplicateKind::Fuzzy);
        }

        Verdict::Distinct
    }
}

/// The candidate survives only when it carries strictly more metadata.
fn keep_richer(candidate: &Listen, buffered: &Listen, kind: DuplicateKind) -> Verdict {
    if candidate.populated_field_count() > buffered.populated_field_count() {
        Verdict::DropBuffered(kind)
    } else {
        Verdict::DropCandidate(kind)
    }
}
