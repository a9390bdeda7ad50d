//! Detection of fatal markers (assertions, panics, faults) in target output.

use serde::Serialize;

use crate::matcher::Pattern;

/// Markers recognised by [`AssertionScanner::default`].
pub const DEFAULT_MARKERS: &[&str] = &[
    "ASSERT",
    "Assertion failed",
    "panicked at",
    "PANIC:",
    "Kernel panic",
    "HardFault",
    "FATAL ERROR",
];

/// Which marker fired, and the line it fired on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssertionRecord {
    pub marker_id: String,
    pub location_text: String,
}

#[derive(Debug, Clone)]
pub struct AssertionScanner {
    markers: Vec<String>,
}

impl Default for AssertionScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MARKERS.iter().copied())
    }
}

impl AssertionScanner {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Returns the first marker found in `text`, scanning line by line.
    ///
    /// Pure: scanning the same text always yields the same record.
    pub fn scan(&self, text: &str) -> Option<AssertionRecord> {
        text.lines().find_map(|line| self.scan_line(line))
    }

    /// Like [`scan`](Self::scan), but skips lines on which `expected`
    /// matches: those belong to the test being checked, not to another one.
    pub fn scan_unrelated(&self, text: &str, expected: &Pattern) -> Option<AssertionRecord> {
        text.lines()
            .filter(|line| !expected.is_match(line))
            .find_map(|line| self.scan_line(line))
    }

    pub fn scan_line(&self, line: &str) -> Option<AssertionRecord> {
        let line = line.trim_end_matches('\r');
        self.markers
            .iter()
            .filter_map(|marker| line.find(marker.as_str()).map(|at| (at, marker)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, marker)| AssertionRecord {
                marker_id: marker.clone(),
                location_text: line.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_first_marker_line() {
        let scanner = AssertionScanner::default();
        let text = "boot ok\nASSERT main.c:42\nthread 'x' panicked at src/lib.rs:1\n";
        let record = scanner.scan(text).unwrap();
        assert_eq!(record.marker_id, "ASSERT");
        assert_eq!(record.location_text, "ASSERT main.c:42");
        assert_eq!(scanner.scan(text), Some(record));
    }

    #[test]
    fn clean_output_has_no_record() {
        let scanner = AssertionScanner::default();
        assert_eq!(scanner.scan("boot ok\ntest1 PASS\n"), None);
        assert_eq!(scanner.scan(""), None);
    }

    #[test]
    fn earliest_marker_on_a_line_wins() {
        let scanner = AssertionScanner::default();
        let record = scanner.scan_line("PANIC: ASSERT failed in idle").unwrap();
        assert_eq!(record.marker_id, "PANIC:");
    }

    #[test]
    fn expected_lines_are_not_unrelated() {
        let scanner = AssertionScanner::default();
        let text = "test_assert ASSERT expected\nother\n";
        let expected = Pattern::literal("test_assert");
        assert_eq!(scanner.scan_unrelated(text, &expected), None);
        assert!(scanner.scan(text).is_some());
    }

    #[test]
    fn custom_markers() {
        let scanner = AssertionScanner::new(["Oops", ""]);
        assert_eq!(scanner.markers(), ["Oops".to_string()]);
        assert_eq!(scanner.scan("ASSERT x\n"), None);
        assert_eq!(scanner.scan("Oops: 0002\n").unwrap().marker_id, "Oops");
    }
}
