//! Lifecycle of one test target, from power-on to teardown.
//!
//! ```text
//! Idle -> PoweringOn -> Booting -> Ready -> Running -> TearingDown -> Done
//!            \______________\________\_________\___________-> Error
//! ```
//!
//! Virtual targets are spawned as a child process whose output is the
//! stream. Physical targets open their console first and are then powered
//! on through a [`PowerController`]. Both share the same state machine.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::checker::{CheckReport, Outcome, TestResultChecker};
use crate::config::{ConsoleConfig, PlatformConfig};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::matcher::{await_pattern, Pattern};
use crate::power::{PowerController, PowerPlan};
use crate::stream::{StreamSource, DEFAULT_POLL_INTERVAL};
use crate::supervisor::{CommandSpec, Exit, ProcessHandle, ProcessSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardState {
    Idle,
    PoweringOn,
    Booting,
    Ready,
    Running,
    TearingDown,
    Done,
    Error,
}

impl BoardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PoweringOn => "powering on",
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::TearingDown => "tearing down",
            Self::Done => "done",
            Self::Error => "in error",
        };
        f.write_str(name)
    }
}

/// Line that marks boot completion, and how long to wait for it.
#[derive(Debug, Clone)]
pub struct BootGate {
    pub pattern: Pattern,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct VirtualTarget {
    pub command: CommandSpec,
    pub boot: Option<BootGate>,
    pub terminate_timeout: Duration,
    process: Option<ProcessHandle>,
}

impl VirtualTarget {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            boot: None,
            terminate_timeout: crate::supervisor::DEFAULT_TERMINATE_TIMEOUT,
            process: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Console {
    Device(PathBuf),
    Tail(PathBuf),
}

impl Console {
    async fn open(&self) -> Result<StreamSource> {
        match self {
            Self::Device(path) => StreamSource::open_device(path).await,
            Self::Tail(path) => Ok(StreamSource::tail_file(path, DEFAULT_POLL_INTERVAL)),
        }
    }
}

impl From<&ConsoleConfig> for Console {
    fn from(config: &ConsoleConfig) -> Self {
        match config {
            ConsoleConfig::Device(path) => Self::Device(path.clone()),
            ConsoleConfig::Tail(path) => Self::Tail(path.clone()),
        }
    }
}

#[derive(Debug)]
pub struct PhysicalTarget {
    pub console: Console,
    pub power: Arc<PowerController>,
    pub power_on: PowerPlan,
    pub boot: Option<BootGate>,
    pub settle: Duration,
}

impl PhysicalTarget {
    pub fn new(console: Console, power: Arc<PowerController>, power_on: PowerPlan) -> Self {
        Self {
            console,
            power,
            power_on,
            boot: None,
            settle: Duration::ZERO,
        }
    }
}

/// The closed set of target kinds a runner can drive.
#[derive(Debug)]
pub enum Target {
    Virtual(VirtualTarget),
    Physical(PhysicalTarget),
}

impl Target {
    /// Builds the target for one platform entry.
    pub fn from_config(platform_id: &str, config: &PlatformConfig) -> Result<Self> {
        match config {
            PlatformConfig::Virtual(v) => {
                let mut target = VirtualTarget::new(v.command().tag(platform_id));
                target.boot = v.boot.pattern()?.map(|pattern| BootGate {
                    pattern,
                    timeout: v.boot.timeout(),
                });
                target.terminate_timeout = Duration::from_secs(v.terminate_timeout_secs);
                Ok(Self::Virtual(target))
            }
            PlatformConfig::Physical(p) => {
                let power = Arc::new(p.power.controller(platform_id)?);
                let mut target = PhysicalTarget::new(Console::from(&p.console), power, p.power.on.clone());
                target.boot = p.boot.pattern()?.map(|pattern| BootGate {
                    pattern,
                    timeout: p.boot.timeout(),
                });
                target.settle = Duration::from_millis(p.settle_ms);
                Ok(Self::Physical(target))
            }
        }
    }

    fn boot(&self) -> Option<&BootGate> {
        match self {
            Self::Virtual(v) => v.boot.as_ref(),
            Self::Physical(p) => p.boot.as_ref(),
        }
    }
}

pub struct BoardRunner {
    state: BoardState,
    target: Target,
    checker: TestResultChecker,
    stream: Option<StreamSource>,
    context: Option<RunContext>,
}

impl BoardRunner {
    pub fn new(target: Target) -> Self {
        Self {
            state: BoardState::Idle,
            target,
            checker: TestResultChecker::default(),
            stream: None,
            context: None,
        }
    }

    pub fn with_checker(mut self, checker: TestResultChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn state(&self) -> BoardState {
        self.state
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Exit status of a virtual target's process, once it has exited.
    pub fn exit_code(&self) -> Option<Exit> {
        match &self.target {
            Target::Virtual(v) => v.process.as_ref().and_then(ProcessHandle::exit_code),
            Target::Physical(_) => None,
        }
    }

    /// Brings the target up until it is [`BoardState::Ready`].
    ///
    /// On failure the runner ends in [`BoardState::Error`] after a
    /// best-effort teardown, and the original error is returned.
    pub async fn start(&mut self, context: &RunContext) -> Result<()> {
        if self.state != BoardState::Idle {
            return Err(self.invalid("start"));
        }
        self.context = Some(context.clone());

        match self.bring_up(context).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(platform = %context.platform_id, %err, "bring-up failed");
                self.teardown().await;
                self.transition(BoardState::Error);
                Err(err)
            }
        }
    }

    async fn bring_up(&mut self, context: &RunContext) -> Result<()> {
        self.transition(BoardState::PoweringOn);
        match &mut self.target {
            Target::Virtual(v) => {
                let supervisor = ProcessSupervisor::new(Arc::clone(&context.printer));
                let (process, stream) = supervisor.spawn(&v.command)?;
                v.process = Some(process);
                self.stream = Some(stream);
            }
            Target::Physical(p) => {
                // The console must be open before power-on to see the boot log.
                self.stream = Some(p.console.open().await?);
                let plan = p.power_on.clone();
                with_power(&p.power, move |power| {
                    power.prepare(&plan)?;
                    power.commit()
                })
                .await?;
                if !p.settle.is_zero() {
                    tokio::time::sleep(p.settle).await;
                }
            }
        }
        self.boot(context).await
    }

    async fn boot(&mut self, context: &RunContext) -> Result<()> {
        self.transition(BoardState::Booting);

        if let Some(gate) = self.target.boot().cloned() {
            let stream = self.stream.as_mut().ok_or_else(|| Error::InvalidState {
                op: "boot",
                state: "without a stream".into(),
            })?;
            let res = await_pattern(stream, &gate.pattern, gate.timeout).await?;
            if !res.is_match() {
                // An emulator that died during boot is the better explanation.
                if res.eof {
                    self.check_exit(true).await?;
                }
                return Err(Error::Boot {
                    platform: context.platform_id.clone(),
                    pattern: gate.pattern.to_string(),
                    timeout: gate.timeout,
                });
            }
            tracing::info!(platform = %context.platform_id, elapsed = ?res.elapsed, "boot complete");
        }

        self.transition(BoardState::Ready);
        Ok(())
    }

    /// The target's stream. The first access moves the runner from
    /// [`BoardState::Ready`] to [`BoardState::Running`].
    pub fn stream(&mut self) -> Result<&mut StreamSource> {
        match self.state {
            BoardState::Ready => self.transition(BoardState::Running),
            BoardState::Running => {}
            _ => return Err(self.invalid("read the stream")),
        }
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(Error::InvalidState {
                op: "read the stream",
                state: "without a stream".into(),
            }),
        }
    }

    /// Checks for `expected` on the target's stream. `timeout` defaults to
    /// the run context's budget.
    ///
    /// A stream failure tears the runner down. A timeout on a virtual target
    /// whose process exited unsuccessfully is reported as
    /// [`Error::ProcessExit`].
    pub async fn check(
        &mut self,
        expected: &Pattern,
        timeout: Option<Duration>,
        single_threaded: bool,
    ) -> Result<CheckReport> {
        let timeout = timeout
            .or_else(|| self.context.as_ref().map(|ctx| ctx.timeout))
            .unwrap_or_default();
        self.stream()?;

        let Some(stream) = self.stream.as_mut() else {
            return Err(self.invalid("check"));
        };
        let report = match self.checker.check(stream, expected, timeout, single_threaded).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(%err, "stream failed, tearing down");
                self.stop_after_error().await;
                return Err(err);
            }
        };

        if report.outcome == Outcome::Timeout {
            let ended = self.stream.as_ref().is_some_and(StreamSource::is_eof);
            self.check_exit(ended).await?;
        }
        Ok(report)
    }

    /// Tears the target down. Idempotent; stopping a finished runner is a
    /// no-op. All teardown steps run even if one fails; the first failure is
    /// returned.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let result = self.teardown().await;
        self.transition(BoardState::Done);
        result
    }

    async fn stop_after_error(&mut self) {
        if let Err(err) = self.teardown().await {
            tracing::warn!(%err, "teardown after stream failure failed");
        }
        self.transition(BoardState::Done);
    }

    /// Fails with the process' exit status if it has exited unsuccessfully.
    /// With `wait`, gives a process whose output already ended a moment to
    /// be reaped first.
    async fn check_exit(&mut self, wait: bool) -> Result<()> {
        let Target::Virtual(v) = &mut self.target else {
            return Ok(());
        };
        let Some(process) = v.process.as_mut() else {
            return Ok(());
        };
        if wait && !process.has_exited() {
            let _ = tokio::time::timeout(Duration::from_secs(1), process.wait()).await;
        }
        process.check_exit()
    }

    async fn teardown(&mut self) -> Result<()> {
        if self.state != BoardState::Idle {
            self.transition(BoardState::TearingDown);
        }
        let mut first_err = None;

        match &mut self.target {
            Target::Virtual(v) => {
                if let Some(process) = v.process.as_mut() {
                    let exit = process.terminate(v.terminate_timeout).await;
                    tracing::debug!(name = process.name(), ?exit, "process terminated");
                }
            }
            Target::Physical(p) => {
                if let Err(err) = with_power(&p.power, PowerController::set_all_off).await {
                    tracing::warn!(bank = p.power.name(), %err, "safe-off failed");
                    first_err.get_or_insert(err);
                }
            }
        }

        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }

        first_err.map_or(Ok(()), Err)
    }

    fn transition(&mut self, to: BoardState) {
        let platform = self
            .context
            .as_ref()
            .map(|ctx| ctx.platform_id.as_str())
            .unwrap_or_default();
        tracing::debug!(platform, from = %self.state, %to, "state change");
        self.state = to;
    }

    fn invalid(&self, op: &'static str) -> Error {
        Error::InvalidState {
            op,
            state: self.state.to_string(),
        }
    }
}

/// Runs a bank operation on the blocking pool; banks may shell out to relay
/// tools while holding the bank lock.
async fn with_power<F>(power: &Arc<PowerController>, op: F) -> Result<()>
where
    F: FnOnce(&PowerController) -> Result<()> + Send + 'static,
{
    let power = Arc::clone(power);
    let bank = power.name().to_owned();
    tokio::task::spawn_blocking(move || op(&power))
        .await
        .map_err(|err| Error::io(format!("power bank `{bank}`"), io::Error::other(err)))?
}

impl Drop for BoardRunner {
    fn drop(&mut self) {
        if matches!(self.state, BoardState::Idle | BoardState::Done | BoardState::Error) {
            return;
        }
        // Dropped mid-run: processes die with their handle, but power lines
        // must be driven off explicitly.
        if let Target::Physical(p) = &self.target {
            if let Err(err) = p.power.set_all_off() {
                tracing::warn!(bank = p.power.name(), %err, "safe-off on drop failed");
            }
        }
    }
}

impl fmt::Debug for BoardRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardRunner")
            .field("state", &self.state)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
