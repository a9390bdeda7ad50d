//! Spawning and supervising a target process (an emulator, usually).
//!
//! The child's stdout and stderr are read line by line. Each line goes to
//! the run's [`Printer`] tagged with the command identity, and into the
//! [`StreamSource`] returned alongside the [`ProcessHandle`].

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::context::Printer;
use crate::error::{Error, Result};
use crate::stream::{Feeder, StreamSource};

/// Grace period between the polite stop signal and a hard kill.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Tag for forwarded output; defaults to the program's file name.
    pub tag: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn identity(&self) -> String {
        if let Some(tag) = &self.tag {
            return tag.clone();
        }
        Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Owner of a running child. Dropping the handle kills the child if it is
/// still alive.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<Exit>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit status, if the process has exited.
    pub fn exit_code(&self) -> Option<Exit> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Fails with [`Error::ProcessExit`] if the process exited unsuccessfully.
    /// A process that is still running passes.
    pub fn check_exit(&self) -> Result<()> {
        match self.exit_code() {
            Some(exit) if !exit.success() => Err(Error::ProcessExit {
                name: self.name.clone(),
                code: exit.code,
            }),
            _ => Ok(()),
        }
    }

    pub async fn wait(&mut self) -> Exit {
        match self.exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => {
                let exit = *exit;
                exit.unwrap_or(Exit { code: None })
            }
            // The watcher went away without reporting; the child was dropped.
            Err(_) => Exit { code: None },
        }
    }

    /// Asks the process to stop, then kills it if it is still alive after
    /// `timeout`. Terminating an exited process is a no-op.
    pub async fn terminate(&mut self, timeout: Duration) -> Exit {
        if let Some(exit) = self.exit_code() {
            return exit;
        }

        if self.request_stop() {
            if let Ok(exit) = tokio::time::timeout(timeout, self.wait()).await {
                tracing::debug!(name = %self.name, ?exit, "process stopped gracefully");
                return exit;
            }
            tracing::warn!(name = %self.name, ?timeout, "process ignored stop request, killing");
        }

        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        self.wait().await
    }

    #[cfg(unix)]
    fn request_stop(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return false;
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(name = %self.name, %err, "SIGTERM failed");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    printer: Arc<dyn Printer>,
}

impl ProcessSupervisor {
    pub fn new(printer: Arc<dyn Printer>) -> Self {
        Self { printer }
    }

    /// Starts `spec` and returns its handle plus a stream of its merged
    /// stdout and stderr.
    pub fn spawn(&self, spec: &CommandSpec) -> Result<(ProcessHandle, StreamSource)> {
        let name = spec.identity();
        let spawn_err = |source| Error::Spawn {
            name: name.clone(),
            source,
        };

        let program = which::which(&spec.program)
            .map_err(|err| spawn_err(io::Error::new(io::ErrorKind::NotFound, err)))?;

        let mut child = Command::new(&program)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let pid = child.id();
        tracing::info!(%name, program = %program.display(), args = ?spec.args, ?pid, "spawned");

        let missing_pipe =
            || spawn_err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe not captured"));
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        let stderr = child.stderr.take().ok_or_else(missing_pipe)?;

        let (feeder, mut stream) = StreamSource::channel(name.clone());
        stream.attach_reader(forward(stdout, &name, &feeder, &self.printer));
        stream.attach_reader(forward(stderr, &name, &feeder, &self.printer));
        drop(feeder);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let watcher_name = name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped.
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => Exit { code: status.code() },
                Err(err) => {
                    tracing::warn!(name = %watcher_name, %err, "failed to reap process");
                    Exit { code: None }
                }
            };
            if exit.success() {
                tracing::info!(name = %watcher_name, "process exited");
            } else {
                tracing::warn!(name = %watcher_name, code = ?exit.code, "process exited unsuccessfully");
            }
            let _ = exit_tx.send(Some(exit));
        });

        let handle = ProcessHandle {
            name,
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        };
        Ok((handle, stream))
    }
}

fn forward<R>(
    pipe: R,
    tag: &str,
    feeder: &Feeder,
    printer: &Arc<dyn Printer>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let tag = tag.to_owned();
    let feeder = feeder.clone();
    let printer = Arc::clone(printer);
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() != Some(&b'\n') {
                        buf.push(b'\n');
                    }
                    let text = String::from_utf8_lossy(&buf);
                    printer.print(&tag, text.trim_end_matches(['\n', '\r']));
                    if !feeder.send(buf.as_slice()) {
                        break;
                    }
                }
                Err(err) => {
                    feeder.fail(err);
                    break;
                }
            }
        }
    })
}
