//! Per-run configuration handed to a [`BoardRunner`](crate::runner::BoardRunner).

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Human-visible sink for target output. Each line is tagged with the
/// identity of whatever produced it.
pub trait Printer: Send + Sync {
    fn print(&self, tag: &str, line: &str);
}

/// Emits target output as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPrinter;

impl Printer for TracingPrinter {
    fn print(&self, tag: &str, line: &str) {
        tracing::info!(target: "target_output", tag, "{line}");
    }
}

/// Writes `[tag] line` to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutPrinter;

impl Printer for StdoutPrinter {
    fn print(&self, tag: &str, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "[{tag}] {line}");
    }
}

/// Keeps every printed line in memory.
#[derive(Debug, Default)]
pub struct CapturePrinter {
    lines: Mutex<Vec<String>>,
}

impl CapturePrinter {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Printer for CapturePrinter {
    fn print(&self, tag: &str, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("[{tag}] {line}"));
    }
}

/// Immutable settings for one test run. Owned by the caller; runners only
/// read it.
#[derive(Clone)]
pub struct RunContext {
    pub platform_id: String,
    /// Default budget for checks that do not pass their own.
    pub timeout: Duration,
    pub printer: Arc<dyn Printer>,
}

impl RunContext {
    pub fn new(platform_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            platform_id: platform_id.into(),
            timeout,
            printer: Arc::new(TracingPrinter),
        }
    }

    pub fn with_printer(mut self, printer: Arc<dyn Printer>) -> Self {
        self.printer = printer;
        self
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("platform_id", &self.platform_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
