use std::sync::atomic::{AtomicU64, Ordering};

/// Classification of a dropped listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    /// Same timestamp, recording and user.
    Exact,
    /// Same timestamp, user and track name, and only one of the two carries a dedup tag.
    Tagged,
    /// Same timestamp, user and track name, neither tagged.
    SameTimestampName,
    /// Timestamps within the fuzzy bound, same user and track name.
    Fuzzy,
}

impl DuplicateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateKind::Exact => "exact",
            DuplicateKind::Tagged => "tagged",
            DuplicateKind::SameTimestampName => "name",
            DuplicateKind::Fuzzy => "fuzzy",
        }
    }
}

/// Counters shared between the producer, the writers and the progress reporter.
/// Every counter is only ever incremented, so relaxed ordering is enough.
#[derive(Debug, Default)]
pub struct ImportStats {
    parsed: AtomicU64,
    parse_errors: AtomicU64,
    invalid_timestamp: AtomicU64,
    unique: AtomicU64,
    exact_duplicates: AtomicU64,
    tagged_duplicates: AtomicU64,
    name_duplicates: AtomicU64,
    fuzzy_duplicates: AtomicU64,
    batches_written: AtomicU64,
    rows_written: AtomicU64,
    rows_already_present: AtomicU64,
    batches_failed: AtomicU64,
    rows_dead_lettered: AtomicU64,
}

impl ImportStats {
    pub fn record_parsed(&self) {
        self.parsed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("listen_import_parsed_total").increment(1);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("listen_import_parse_errors_total").increment(1);
    }

    pub fn record_invalid_timestamp(&self) {
        self.invalid_timestamp.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("listen_import_invalid_timestamp_total").increment(1);
    }

    /// Returns the updated number of unique listens.
    pub fn record_unique(&self) -> u64 {
        metrics::counter!("listen_import_unique_total").increment(1);
        self.unique.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_duplicate(&self, kind: DuplicateKind) {
        let counter = match kind {
            DuplicateKind::Exact => &self.exact_duplicates,
            DuplicateKind::Tagged => &self.tagged_duplicates,
            DuplicateKind::SameTimestampName => &self.name_duplicates,
            DuplicateKind::Fuzzy => &self.fuzzy_duplicates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("listen_import_duplicates_total", "kind" => kind.as_str()).increment(1);
    }

    pub fn record_batch_written(&self, rows: u64, inserted: u64) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(inserted, Ordering::Relaxed);
        self.rows_already_present
            .fetch_add(rows.saturating_sub(inserted), Ordering::Relaxed);
        metrics::counter!("listen_import_batches_total", "result" => "written").increment(1);
        metrics::counter!("listen_import_rows_written_total").increment(inserted);
    }

    pub fn record_batch_failed(&self, dead_lettered_rows: u64) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.rows_dead_lettered
            .fetch_add(dead_lettered_rows, Ordering::Relaxed);
        metrics::counter!("listen_import_batches_total", "result" => "failed").increment(1);
    }

    pub fn unique(&self) -> u64 {
        self.unique.load(Ordering::Relaxed)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            parsed: self.parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            invalid_timestamp: self.invalid_timestamp.load(Ordering::Relaxed),
            unique: self.unique.load(Ordering::Relaxed),
            exact_duplicates: self.exact_duplicates.load(Ordering::Relaxed),
            tagged_duplicates: self.tagged_duplicates.load(Ordering::Relaxed),
            name_duplicates: self.name_duplicates.load(Ordering::Relaxed),
            fuzzy_duplicates: self.fuzzy_duplicates.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_already_present: self.rows_already_present.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            rows_dead_lettered: self.rows_dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `ImportStats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub parsed: u64,
    pub parse_errors: u64,
    pub invalid_timestamp: u64,
    pub unique: u64,
    pub exact_duplicates: u64,
    pub tagged_duplicates: u64,
    pub name_duplicates: u64,
    pub fuzzy_duplicates: u64,
    pub batches_written: u64,
    pub rows_written: u64,
    pub rows_already_present: u64,
    pub batches_failed: u64,
    pub rows_dead_lettered: u64,
}

impl StatsSnapshot {
    pub fn duplicates(&self) -> u64 {
        self.exact_duplicates + self.tagged_duplicates + self.name_duplicates + self.fuzzy_duplicates
    }

    /// Every parsed listen ends up in exactly one of these buckets.
    pub fn accounted(&self) -> u64 {
        self.unique + self.duplicates() + self.invalid_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accounts_for_every_listen() {
        let stats = ImportStats::default();
        for _ in 0..6 {
            stats.record_parsed();
        }
        assert_eq!(stats.record_unique(), 1);
        assert_eq!(stats.record_unique(), 2);
        stats.record_duplicate(DuplicateKind::Exact);
        stats.record_duplicate(DuplicateKind::Tagged);
        stats.record_duplicate(DuplicateKind::Fuzzy);
        stats.record_invalid_timestamp();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.duplicates(), 3);
        assert_eq!(snapshot.accounted(), snapshot.parsed);
    }

    #[test]
    fn test_batch_counters() {
        let stats = ImportStats::default();
        stats.record_batch_written(10, 7);
        stats.record_batch_failed(5);
        stats.record_batch_failed(0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_written, 1);
        assert_eq!(snapshot.rows_written, 7);
        assert_eq!(snapshot.rows_already_present, 3);
        assert_eq!(snapshot.batches_failed, 2);
        assert_eq!(snapshot.rows_dead_lettered, 5);
    }
}
