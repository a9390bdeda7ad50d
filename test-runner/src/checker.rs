//! Resolution of one test's outcome from a target stream.
//!
//! A check races the expected pattern against the assertion markers known
//! to [`AssertionScanner`]. Whether an assertion seen *before* the check
//! started disqualifies it depends on the target's threading model:
//!
//! - single-threaded targets run one test at a time, so any earlier fatal
//!   assertion means the expected line will never come and the check fails
//!   at once;
//! - multi-threaded targets run independent test threads, so every check
//!   waits its full budget for its own pattern and only then falls back to
//!   reporting an assertion.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::assertion::{AssertionRecord, AssertionScanner};
use crate::error::Result;
use crate::matcher::{await_line, Pattern};
use crate::stream::StreamSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { matched: String },
    Failure { assertion: AssertionRecord },
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub pattern: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Lines consumed by this check.
    pub consumed_text: String,
    pub elapsed: Duration,
}

enum Hit {
    Expected(String),
    Assertion(AssertionRecord),
}

#[derive(Debug, Clone, Default)]
pub struct TestResultChecker {
    scanner: AssertionScanner,
}

impl TestResultChecker {
    pub fn new(scanner: AssertionScanner) -> Self {
        Self { scanner }
    }

    pub fn scanner(&self) -> &AssertionScanner {
        &self.scanner
    }

    /// Waits up to `timeout` (zero waits forever) for `expected` on
    /// `stream`.
    ///
    /// `Failure` and `Timeout` are ordinary outcomes; only stream failures
    /// are returned as errors.
    pub async fn check(
        &self,
        stream: &mut StreamSource,
        expected: &Pattern,
        timeout: Duration,
        single_threaded: bool,
    ) -> Result<CheckReport> {
        let start = Instant::now();
        let report = |outcome, consumed_text| CheckReport {
            pattern: expected.to_string(),
            outcome,
            consumed_text,
            elapsed: start.elapsed(),
        };

        if single_threaded {
            if let Some(assertion) = self.scanner.scan_unrelated(stream.history(), expected) {
                tracing::info!(
                    stream = stream.name(),
                    pattern = %expected,
                    marker = %assertion.marker_id,
                    "earlier assertion halts single-threaded target"
                );
                return Ok(report(Outcome::Failure { assertion }, String::new()));
            }
        }

        let scanner = &self.scanner;
        let res = await_line(stream, timeout, |line| {
            if let Some(matched) = expected.find(line) {
                return Some(Hit::Expected(matched.to_owned()));
            }
            if single_threaded {
                return scanner.scan_line(line).map(Hit::Assertion);
            }
            None
        })
        .await?;

        let outcome = match res.matched {
            Some(Hit::Expected(matched)) => Outcome::Success { matched },
            Some(Hit::Assertion(assertion)) => Outcome::Failure { assertion },
            None => match self.scanner.scan(stream.history()) {
                Some(assertion) => Outcome::Failure { assertion },
                None => Outcome::Timeout,
            },
        };

        match &outcome {
            Outcome::Success { .. } => {
                tracing::debug!(stream = stream.name(), pattern = %expected, "matched")
            }
            Outcome::Failure { assertion } => tracing::info!(
                stream = stream.name(),
                pattern = %expected,
                location = %assertion.location_text,
                "assertion observed"
            ),
            Outcome::Timeout => tracing::info!(
                stream = stream.name(),
                pattern = %expected,
                ?timeout,
                eof = res.eof,
                "timed out"
            ),
        }

        Ok(report(outcome, res.consumed_text))
    }
}
