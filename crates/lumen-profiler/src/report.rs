//! Fixed-width timing table

use crate::timer::{TimerId, TimerStats};

pub(crate) const FOOTER: &str = "[T]";

pub(crate) fn header() -> String {
    format!(
        "[T] Timing information: {:41} {:>5} {:>9} {:>9} {:>9} +/- {:>9} {:>9}",
        "", "N", "Min", "Max", "Avg", "DT", "Tot"
    )
}

pub(crate) fn line(id: &TimerId, stats: &TimerStats) -> String {
    format!(
        "[T] Profiler {:>44} for '{}': {:>5} {:>9.4} {:>9.4} {:>9.5} +/- {:>9.4} {:>9.4}",
        id.to_string(),
        stats.title,
        stats.count,
        stats.min_ms,
        stats.max_ms,
        stats.mean_ms,
        stats.std_ms,
        stats.total_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_columns() {
        let stats = TimerStats {
            title: "fill".into(),
            count: 4,
            stops: 4,
            min_ms: 1.0,
            max_ms: 2.0,
            mean_ms: 1.5,
            std_ms: 0.5,
            total_ms: 6.0,
        };

        let line = line(&TimerId::from("buffer_fill_ALL"), &stats);
        assert!(line.starts_with("[T] Profiler "));
        assert!(line.contains("for 'fill':"));
        assert!(line.contains("1.50000 +/-"));
        assert!(line.ends_with("6.0000"));
    }

    #[test]
    fn test_header_columns() {
        let header = header();
        for col in ["N", "Min", "Max", "Avg", "DT", "Tot"] {
            assert!(header.contains(col));
        }
    }
}
