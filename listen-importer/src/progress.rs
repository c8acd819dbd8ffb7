use std::fmt::Write;
use std::time::{Duration, Instant};

use tracing::info;

use crate::stats::StatsSnapshot;

/// Logs the unique listen count every `interval` listens, and the totals at the end.
pub struct ProgressReporter {
    interval: u64,
    started: Instant,
    next_report: u64,
}

impl ProgressReporter {
    pub fn new(interval: u64) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            started: Instant::now(),
            next_report: interval,
        }
    }

    /// Called with the running unique count as listens are emitted.
    pub fn observe(&mut self, unique: u64) {
        if let Some(line) = self.progress_line(unique, self.started.elapsed()) {
            info!("{}", line);
        }
    }

    /// The line to log for this count, if an interval boundary was crossed since the last one.
    pub fn progress_line(&mut self, unique: u64, elapsed: Duration) -> Option<String> {
        if unique < self.next_report {
            return None;
        }
        // Skip boundaries that were crossed all at once.
        self.next_report = (unique / self.interval + 1) * self.interval;

        Some(format!(
            "{} unique listens, {} listens/s",
            unique,
            per_second(unique, elapsed)
        ))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn per_second(count: u64, elapsed: Duration) -> u64 {
    let seconds = elapsed.as_secs_f64();
    if seconds > 0.0 {
        (count as f64 / seconds) as u64
    } else {
        count
    }
}

/// Render the final totals of a run, one counter per line.
pub fn render_summary(stats: &StatsSnapshot, elapsed: Duration) -> String {
    let mut out = String::new();
    let lines = [
        ("parsed", stats.parsed),
        ("parse errors", stats.parse_errors),
        ("invalid timestamp", stats.invalid_timestamp),
        ("unique", stats.unique),
        ("exact duplicates", stats.exact_duplicates),
        ("tagged duplicates", stats.tagged_duplicates),
        ("same timestamp duplicates", stats.name_duplicates),
        ("fuzzy duplicates", stats.fuzzy_duplicates),
        ("batches written", stats.batches_written),
        ("rows written", stats.rows_written),
        ("rows already present", stats.rows_already_present),
        ("batches failed", stats.batches_failed),
        ("rows dead lettered", stats.rows_dead_lettered),
    ];
    for (name, value) in lines {
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{name:>26}: {value}");
    }
    let _ = write!(
        out,
        "{:>26}: {:.1}s, {} rows/s",
        "elapsed",
        elapsed.as_secs_f64(),
        per_second(stats.rows_written, elapsed)
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_per_interval() {
        let mut reporter = ProgressReporter::new(100);
        let elapsed = Duration::from_secs(2);

        assert!(reporter.progress_line(99, elapsed).is_none());
        assert_eq!(
            reporter.progress_line(100, elapsed).as_deref(),
            Some("100 unique listens, 50 listens/s")
        );
        assert!(reporter.progress_line(101, elapsed).is_none());
        assert!(reporter.progress_line(199, elapsed).is_none());
        assert!(reporter.progress_line(200, elapsed).is_some());
    }

    #[test]
    fn test_skipped_boundaries_are_reported_once() {
        let mut reporter = ProgressReporter::new(10);
        let elapsed = Duration::from_secs(1);

        assert!(reporter.progress_line(35, elapsed).is_some());
        assert!(reporter.progress_line(39, elapsed).is_none());
        assert!(reporter.progress_line(40, elapsed).is_some());
    }

    #[test]
    fn test_summary_lists_every_counter() {
        let stats = StatsSnapshot {
            parsed: 10,
            unique: 7,
            exact_duplicates: 2,
            invalid_timestamp: 1,
            rows_written: 7,
            batches_written: 1,
            ..Default::default()
        };
        let text = render_summary(&stats, Duration::from_secs(1));

        assert!(text.contains("parsed: 10"));
        assert!(text.contains("exact duplicates: 2"));
        assert!(text.contains("rows dead lettered: 0"));
        assert!(text.ends_with("elapsed: 1.0s, 7 rows/s"));
    }
}
