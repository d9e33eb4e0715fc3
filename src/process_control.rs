/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use async_trait::async_trait;
use std::{
    fmt,
    fs::{File, OpenOptions},
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use subprocess::{Exec, ExitStatus, Popen, Redirection};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often the reaper checks whether the service has exited or should be stopped.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Time a terminated service gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Command string is not POSIX compliant or is empty: {0}")]
    InvalidCommand(String),

    #[error("Unable to open log file {path:?}")]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn process, command: {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with code {exit_code}, command: {command}")]
    Failed { command: String, exit_code: i32 },

    #[error("Process timed out after {timeout:?}, command: {command}")]
    TimedOut { command: String, timeout: Duration },

    #[error("Lost track of process, command: {command}")]
    Lost {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Exit code of a process that ran to completion unsuccessfully.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Failed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Append-only destinations for a child's stdout and stderr. Both may point at the same
/// file. Files are created when missing and never truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSinks {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogSinks {
    pub fn new(stdout: PathBuf, stderr: PathBuf) -> Self {
        Self { stdout, stderr }
    }

    /// Both streams go to the same file.
    pub fn combined(path: PathBuf) -> Self {
        Self {
            stdout: path.clone(),
            stderr: path,
        }
    }

    pub fn open(&self) -> Result<(File, File), ProcessError> {
        Ok((open_append(&self.stdout)?, open_append(&self.stderr)?))
    }
}

fn open_append(path: &Path) -> Result<File, ProcessError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|source| ProcessError::Sink {
            path: path.to_path_buf(),
            source,
        })
}

/// A program, its arguments and the directory to run it in.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    /// Splits a command line into POSIX words. A relative program path such as
    /// `./gradlew` is resolved against `working_dir`; bare names are left for `PATH`.
    pub fn parse(command_line: &str, working_dir: &Path) -> Result<Self, ProcessError> {
        let words = shlex::split(command_line)
            .ok_or_else(|| ProcessError::InvalidCommand(command_line.to_string()))?;

        match &words[..] {
            [program, args @ ..] => {
                let program = Path::new(program);
                let program = if program.is_relative() && program.components().count() > 1 {
                    working_dir.join(program)
                } else {
                    program.to_path_buf()
                };

                Ok(Self::new(program, working_dir).args(args.iter().cloned()))
            }
            _ => Err(ProcessError::InvalidCommand(command_line.to_string())),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.args.iter() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Starts external processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the command to completion with its output appended to `sinks`. Blocks the
    /// calling task until the process exits; a non-zero exit code is an error.
    async fn run(&self, command: &CommandSpec, sinks: &LogSinks) -> Result<(), ProcessError>;

    /// Launches a long running process without waiting for it.
    fn start(&self, command: &CommandSpec, sinks: &LogSinks)
        -> Result<ServiceHandle, ProcessError>;
}

/// Ownership of a launched long running process.
///
/// The process is reaped by a background task whose outcome is delivered through
/// [`ServiceHandle::wait_for_exit`]. Dropping the handle asks the task to terminate the
/// process, so a process never outlives the handle that started it.
pub struct ServiceHandle {
    command: String,
    stop: CancellationToken,
    exited: CancellationToken,
    task: JoinHandle<Result<i32, ProcessError>>,
}

impl ServiceHandle {
    /// Spawns the task that owns a launched process.
    ///
    /// `reaper` receives a stop token and must resolve to the process's exit code once it
    /// has exited, terminating it first if the token is cancelled.
    pub fn spawn<F, Fut>(command: &str, reaper: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<i32, ProcessError>> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let exited = CancellationToken::new();

        let reaping = reaper(stop.clone());
        let exit_guard = exited.clone().drop_guard();
        let task = tokio::spawn(async move {
            let _exit_guard = exit_guard;
            reaping.await
        });

        Self {
            command: command.to_string(),
            stop,
            exited,
            task,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Cancelled as soon as the process has exited, for whatever reason.
    pub fn exit_signal(&self) -> &CancellationToken {
        &self.exited
    }

    /// Waits for the process to exit on its own. A non-zero exit code is an error.
    ///
    /// With a `limit`, a process still running once it elapses is killed and reported as
    /// [`ProcessError::TimedOut`].
    pub async fn wait_for_exit(self, limit: Option<Duration>) -> Result<(), ProcessError> {
        let command = self.command.clone();

        if let Some(limit) = limit {
            if tokio::time::timeout(limit, self.exited.cancelled())
                .await
                .is_err()
            {
                self.kill().await?;
                return Err(ProcessError::TimedOut {
                    command,
                    timeout: limit,
                });
            }
        }

        let exit_code = self.join().await?;
        if exit_code != 0 {
            return Err(ProcessError::Failed { command, exit_code });
        }
        Ok(())
    }

    /// Terminates the process if it is still running and waits until it has been reaped.
    /// Returns the exit code it was reaped with.
    pub async fn kill(self) -> Result<i32, ProcessError> {
        self.stop.cancel();
        self.join().await
    }

    async fn join(mut self) -> Result<i32, ProcessError> {
        let command = self.command.clone();
        (&mut self.task).await.map_err(|err| ProcessError::Lost {
            command,
            source: std::io::Error::other(err),
        })?
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("command", &self.command)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Runs real operating system processes. Run-to-completion commands go through
/// `tokio::process`, the long running service through `subprocess` and a blocking reaper.
#[derive(Debug, Default, Clone)]
pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, command: &CommandSpec, sinks: &LogSinks) -> Result<(), ProcessError> {
        let (out_file, err_file) = sinks.open()?;
        let command_line = command.to_string();
        debug!("Running command {} in {:?}", command_line, command.working_dir);

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out_file))
            .stderr(Stdio::from(err_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let status = match command.timeout {
            None => child.wait().await,
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    if let Err(err) = child.kill().await {
                        warn!("Failed to kill timed out process {}\n{}", command_line, err);
                    }
                    return Err(ProcessError::TimedOut {
                        command: command_line,
                        timeout,
                    });
                }
            },
        }
        .map_err(|source| ProcessError::Lost {
            command: command_line.clone(),
            source,
        })?;

        match status.code() {
            Some(0) => Ok(()),
            code => Err(ProcessError::Failed {
                command: command_line,
                exit_code: code.unwrap_or(-1),
            }),
        }
    }

    fn start(
        &self,
        command: &CommandSpec,
        sinks: &LogSinks,
    ) -> Result<ServiceHandle, ProcessError> {
        let (out_file, err_file) = sinks.open()?;
        let command_line = command.to_string();
        debug!("Running command {} in detached mode", command_line);

        let popen = Exec::cmd(&command.program)
            .args(command.args.as_slice())
            .cwd(&command.working_dir)
            .stdout(Redirection::File(out_file))
            .stderr(Redirection::File(err_file))
            .popen()
            .map_err(|err| ProcessError::Spawn {
                command: command_line.clone(),
                source: std::io::Error::other(err.to_string()),
            })?;

        let reaper_command = command_line.clone();
        Ok(ServiceHandle::spawn(&command_line, move |stop| async move {
            let command = reaper_command.clone();
            tokio::task::spawn_blocking(move || reap(popen, &stop, &reaper_command))
                .await
                .map_err(|err| ProcessError::Lost {
                    command,
                    source: std::io::Error::other(err),
                })?
        }))
    }
}

/// Blocks until the process exits, terminating it once `stop` is cancelled.
fn reap(mut popen: Popen, stop: &CancellationToken, command: &str) -> Result<i32, ProcessError> {
    let lost = |err: subprocess::PopenError| ProcessError::Lost {
        command: command.to_string(),
        source: std::io::Error::other(err.to_string()),
    };

    loop {
        if stop.is_cancelled() {
            debug!("Terminating {}", command);
            if let Err(err) = popen.terminate() {
                warn!("Failed to terminate process {}\n{}", command, err);
            }

            let status = match popen.wait_timeout(KILL_GRACE).map_err(lost)? {
                Some(status) => status,
                None => {
                    warn!("{} ignored termination, killing it", command);
                    if let Err(err) = popen.kill() {
                        warn!("Failed to kill process {}\n{}", command, err);
                    }
                    popen.wait().map_err(lost)?
                }
            };
            return Ok(exit_code(status));
        }

        if let Some(status) = popen.wait_timeout(REAP_INTERVAL).map_err(lost)? {
            debug!("{} exited with {:?}", command, status);
            return Ok(exit_code(status));
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code as i32,
        ExitStatus::Signaled(signal) => 128 + signal as i32,
        ExitStatus::Other(code) => code,
        ExitStatus::Undetermined => -1,
    }
}
