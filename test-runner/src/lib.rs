//! Console monitoring and lifecycle engine for QEMU and board test runs.
//!
//! A [`BoardRunner`] powers a target on (or spawns its emulator), exposes
//! the target's console as a forward-only [`StreamSource`], and tears it
//! down again. A [`TestResultChecker`] decides each test's outcome by racing
//! the expected pattern against known assertion markers under a timeout.

pub mod assertion;
pub mod checker;
pub mod config;
pub mod context;
pub mod error;
pub mod matcher;
pub mod power;
pub mod runner;
pub mod stream;
pub mod supervisor;

pub use assertion::{AssertionRecord, AssertionScanner};
pub use checker::{CheckReport, Outcome, TestResultChecker};
pub use config::{Config, PlatformConfig};
pub use context::{Printer, RunContext};
pub use error::{Error, Result};
pub use matcher::{await_pattern, MatchResult, Pattern};
pub use power::{LineState, PowerController, PowerPlan};
pub use runner::{BoardRunner, BoardState, Target};
pub use stream::{ReadLine, StreamSource};
pub use supervisor::{CommandSpec, ProcessHandle, ProcessSupervisor};
