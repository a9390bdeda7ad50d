//! Online pattern matching against a [`StreamSource`].

use std::fmt;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::stream::{ReadLine, StreamSource};

/// Text a test expects to observe on a single line.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    pub fn regex(expr: &str) -> Result<Self> {
        Regex::new(expr)
            .map(Self::Regex)
            .map_err(|err| Error::config(format!("invalid pattern `{expr}`: {err}")))
    }

    /// Returns the matched part of `line`, if any.
    pub fn find<'a>(&self, line: &'a str) -> Option<&'a str> {
        match self {
            Self::Literal(text) => line.find(text.as_str()).map(|at| &line[at..at + text.len()]),
            Self::Regex(re) => re.find(line).map(|m| m.as_str()),
        }
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.find(line).is_some()
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(text) => text,
            Self::Regex(re) => re.as_str(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one `await` consumed from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult<T = String> {
    /// Every line read by this call, up to and including the matching one.
    pub consumed_text: String,
    /// `None` when the budget ran out (or the stream ended) first.
    pub matched: Option<T>,
    /// The stream ended before a match; no further line can arrive.
    pub eof: bool,
    pub elapsed: Duration,
}

impl<T> MatchResult<T> {
    pub fn is_match(&self) -> bool {
        self.matched.is_some()
    }
}

/// Converts a timeout into a deadline; a zero timeout waits forever.
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// Waits for a completed line containing `pattern`.
///
/// Consumption is forward-only: a following call resumes with the line
/// after the match.
pub async fn await_pattern(
    source: &mut StreamSource,
    pattern: &Pattern,
    timeout: Duration,
) -> Result<MatchResult> {
    await_line(source, timeout, |line| pattern.find(line).map(str::to_owned)).await
}

/// Reads lines until `probe` returns a hit or `timeout` elapses.
///
/// This is the core loop shared by [`await_pattern`] and the result checker,
/// which races the expected pattern against assertion markers with one probe.
pub async fn await_line<T, F>(
    source: &mut StreamSource,
    timeout: Duration,
    mut probe: F,
) -> Result<MatchResult<T>>
where
    F: FnMut(&str) -> Option<T>,
{
    let start = Instant::now();
    let deadline = deadline_after(timeout);
    let mut consumed_text = String::new();

    loop {
        match source.read_line(deadline).await? {
            ReadLine::Line(line) => {
                consumed_text.push_str(&line);
                consumed_text.push('\n');
                if let Some(hit) = probe(&line) {
                    return Ok(MatchResult {
                        consumed_text,
                        matched: Some(hit),
                        eof: false,
                        elapsed: start.elapsed(),
                    });
                }
            }
            ReadLine::WouldBlock => {
                tracing::debug!(stream = source.name(), ?timeout, "no match before deadline");
                return Ok(MatchResult {
                    consumed_text,
                    matched: None,
                    eof: false,
                    elapsed: start.elapsed(),
                });
            }
            ReadLine::Eof => {
                tracing::debug!(stream = source.name(), "stream ended before a match");
                return Ok(MatchResult {
                    consumed_text,
                    matched: None,
                    eof: true,
                    elapsed: start.elapsed(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_regex_find() {
        let lit = Pattern::literal("PASS");
        assert_eq!(lit.find("test1 PASS (3ms)"), Some("PASS"));
        assert_eq!(lit.find("test1 FAIL"), None);

        let re = Pattern::regex(r"test\d+ PASS").unwrap();
        assert_eq!(re.find("[00:01] test12 PASS"), Some("test12 PASS"));
        assert!(!re.is_match("test PASS"));
    }

    #[test]
    fn bad_regex_is_config_error() {
        let err = Pattern::regex("(unclosed").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn match_returns_consumed_prefix() {
        let (feeder, mut source) = StreamSource::channel("t");
        feeder.send("boot ok\ntest1 PASS\ntest2 PASS\n");

        let res = await_pattern(&mut source, &Pattern::literal("test1 PASS"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(res.matched.as_deref(), Some("test1 PASS"));
        assert_eq!(res.consumed_text, "boot ok\ntest1 PASS\n");
        assert!(res.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sequential_awaits_never_reread() {
        let (feeder, mut source) = StreamSource::channel("t");
        feeder.send("L1 alpha\nL2 beta\nL3 gamma\n");
        let timeout = Duration::from_secs(1);

        let first = await_pattern(&mut source, &Pattern::literal("alpha"), timeout)
            .await
            .unwrap();
        assert_eq!(first.consumed_text, "L1 alpha\n");

        let second = await_pattern(&mut source, &Pattern::literal("gamma"), timeout)
            .await
            .unwrap();
        assert!(second.is_match());
        assert!(!second.consumed_text.contains("L1"));
        assert_eq!(second.consumed_text, "L2 beta\nL3 gamma\n");

        // A pattern that was already consumed is not found again.
        let again = await_pattern(&mut source, &Pattern::literal("alpha"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!again.is_match());
    }

    #[tokio::test]
    async fn pattern_split_across_reads_matches_once_line_completes() {
        let (feeder, mut source) = StreamSource::channel("t");
        let writer = tokio::spawn(async move {
            feeder.send("test1 P");
            tokio::time::sleep(Duration::from_millis(50)).await;
            feeder.send("ASS\n");
            feeder
        });

        let res = await_pattern(&mut source, &Pattern::literal("test1 PASS"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(res.matched.as_deref(), Some("test1 PASS"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_is_honored() {
        let (_feeder, mut source) = StreamSource::channel("t");
        let timeout = Duration::from_millis(300);
        let start = std::time::Instant::now();
        let res = await_pattern(&mut source, &Pattern::literal("never"), timeout)
            .await
            .unwrap();
        let waited = start.elapsed();
        assert!(!res.is_match());
        assert!(!res.eof);
        assert!(waited >= timeout, "returned early after {waited:?}");
        assert!(waited < timeout + Duration::from_secs(1), "returned late after {waited:?}");
    }

    #[tokio::test]
    async fn partial_line_survives_timeout() {
        let (feeder, mut source) = StreamSource::channel("t");
        feeder.send("half of a li");
        let res = await_pattern(&mut source, &Pattern::literal("line"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!res.is_match());
        assert_eq!(res.consumed_text, "");

        feeder.send("ne\n");
        let res = await_pattern(&mut source, &Pattern::literal("line"), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(res.consumed_text, "half of a line\n");
    }

    #[tokio::test]
    async fn eof_ends_wait_early() {
        let (feeder, mut source) = StreamSource::channel("t");
        feeder.send("only line\n");
        drop(feeder);
        let res = await_pattern(&mut source, &Pattern::literal("PASS"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(res.eof);
        assert_eq!(res.consumed_text, "only line\n");
        assert!(res.elapsed < Duration::from_secs(5));
    }
}
