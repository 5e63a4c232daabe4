//! Worker bootstrap: spawn with piped stdio, then read the handshake.
//!
//! Flow:
//! 1. Spawn the worker with stdin/stdout piped (one atomic platform operation)
//! 2. Read header, address and token from the worker's stdout
//! 3. Hand back the top-level channel, which owns the process
//!
//! Any handshake failure kills and reaps the worker before returning.

use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::channel::Channel;
use crate::error::{ChannelError, SpawnError};
use crate::protocol::read_handshake;

/// Where the worker's stderr goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    #[default]
    Inherit,
    Null,
}

impl From<StderrMode> for Stdio {
    fn from(mode: StderrMode) -> Self {
        match mode {
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Null => Stdio::null(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Overrides `argv[0]`; defaults to `program`.
    pub arg0: Option<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    pub stderr: StderrMode,
    /// How long `close` waits for the worker to exit on its own before
    /// signalling it.
    pub shutdown_grace: Duration,
}

impl LaunchConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            arg0: None,
            envs: Vec::new(),
            stderr: StderrMode::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Build from a conventional argument vector: `argv[0]` is the program,
    /// the rest are its arguments. Returns `None` for an empty vector.
    pub fn from_argv<S: AsRef<OsStr>>(argv: &[S]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.as_ref()).with_args(rest))
    }

    pub fn with_args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn with_arg0(mut self, arg0: impl Into<OsString>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must return a child whose stdin and stdout are piped.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &LaunchConfig) -> Result<Child, SpawnError>;
}

/// Spawns the configured program directly.
///
/// `std::process::Command` closes the child's ends of the pipes in the
/// parent and every inherited descriptor is close-on-exec, so neither side
/// leaks pipe ends.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &LaunchConfig) -> Result<Child, SpawnError> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(config.stderr);
        if let Some(arg0) = &config.arg0 {
            command.arg0(arg0);
        }
        Ok(command.spawn()?)
    }
}

/// Launch a worker with the default spawner.
pub fn launch(config: LaunchConfig) -> Result<Channel, ChannelError> {
    launch_with(&CommandSpawner, config)
}

/// Launch a worker through `spawner` and complete the handshake.
pub fn launch_with(
    spawner: &dyn WorkerSpawner,
    config: LaunchConfig,
) -> Result<Channel, ChannelError> {
    tracing::debug!(program = %config.program.display(), "Spawning worker");
    let mut child = spawner.spawn(&config)?;
    let pid = child.id();

    let pipes = take_pipes(&mut child);
    let (writer, mut reader) = match pipes {
        Ok(pipes) => pipes,
        Err(e) => {
            reap(&mut child);
            return Err(e.into());
        }
    };

    tracing::trace!(pid, "Waiting for handshake");
    let rendezvous = match read_handshake(&mut reader) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(pid, error = %e, "Handshake failed, killing worker");
            drop(writer);
            drop(reader);
            reap(&mut child);
            return Err(e.into());
        }
    };

    tracing::info!(pid, address = %rendezvous.address, "Worker ready");
    Ok(Channel::top_level(
        rendezvous,
        reader,
        writer,
        child,
        config.shutdown_grace,
    ))
}

fn take_pipes(
    child: &mut Child,
) -> Result<(std::process::ChildStdin, std::process::ChildStdout), SpawnError> {
    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingPipe("stdout"))?;
    Ok((stdin, stdout))
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::trace!(error = %e, "Kill after failed launch");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(error = %e, "Failed to reap worker after failed launch");
    }
}
