/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! One benchmark cycle: configure, build, launch, wait for readiness, load test, shut
//! down, wait for teardown and aggregate.
//!
//! Every phase blocks until its postcondition holds, which is what orders them. The
//! service process is the only thing that outlives a phase; it is owned by a
//! [`ServiceHandle`] created at launch and reaped before the cycle returns, on success
//! or failure.

use crate::{
    health::{HealthPoller, HealthState, PollError, ServiceClient, ShutdownError},
    models::{BenchmarkResult, LoadGeneratorConfig, VariantConfig},
    parser::{self, ParseError},
    process_control::{CommandSpec, LogSinks, ProcessError, ProcessRunner, ServiceHandle},
    properties::{self, PropertiesError},
};
use colored::Colorize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(not(windows))]
static LINE_ENDING: &str = "\n";
#[cfg(windows)]
static LINE_ENDING: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    Building,
    Launching,
    AwaitingReady,
    Benchmarking,
    ShuttingDown,
    AwaitingTerminated,
    Aggregating,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Configuring => "configuring",
            Phase::Building => "building",
            Phase::Launching => "launching",
            Phase::AwaitingReady => "awaiting ready",
            Phase::Benchmarking => "benchmarking",
            Phase::ShuttingDown => "shutting down",
            Phase::AwaitingTerminated => "awaiting terminated",
            Phase::Aggregating => "aggregating",
            Phase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum PhaseFailure {
    #[error(transparent)]
    Properties(#[from] PropertiesError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Built binary not found at {0:?}")]
    MissingBinary(PathBuf),

    #[error("Service process exited before shutdown was requested")]
    ServiceExited,

    #[error("{action} {path:?}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl PhaseFailure {
    fn io(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| PhaseFailure::Io {
            action,
            path,
            source,
        }
    }
}

/// A failed cycle, tagged with the phase it failed in.
#[derive(Debug, Error)]
#[error("Benchmark cycle failed while {phase}")]
pub struct CycleError {
    pub phase: Phase,
    #[source]
    pub cause: PhaseFailure,
}

fn failed_in<E: Into<PhaseFailure>>(phase: Phase) -> impl FnOnce(E) -> CycleError {
    move |err| CycleError {
        phase,
        cause: err.into(),
    }
}

/// Where the codebase under test lives and how to build, run and load test it.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkTarget {
    pub root: PathBuf,
    /// Properties file the variant's flag is written to.
    pub properties: PathBuf,
    pub flag_key: String,
    pub build: CommandSpec,
    /// Deleted before every build so a stale artifact can never be launched.
    pub build_dir: PathBuf,
    pub binary: PathBuf,
    /// Load generator command line template, see [`load_command`].
    pub load_command: String,
    pub load_timeout: Option<Duration>,
    pub max_runs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub ready_deadline: Option<Duration>,
    pub terminated_deadline: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            ready_deadline: None,
            terminated_deadline: None,
        }
    }
}

/// Substitutes `{requests}`, `{concurrency}` and `{url}` in the template and splits it
/// into a command run from `working_dir`.
pub fn load_command(
    template: &str,
    load: &LoadGeneratorConfig,
    working_dir: &Path,
) -> Result<CommandSpec, ProcessError> {
    let command_line = template
        .replace("{requests}", &load.requests.to_string())
        .replace("{concurrency}", &load.concurrency.to_string())
        .replace("{url}", &load.url);
    CommandSpec::parse(&command_line, working_dir)
}

/// Removes the output of a previous build, if any.
pub fn remove_build_output(build_dir: &Path) -> std::io::Result<()> {
    if build_dir.exists() {
        println!("> deleting {}", build_dir.display().to_string().bright_black());
        fs::remove_dir_all(build_dir)?;
    }
    Ok(())
}

pub struct BenchmarkOrchestrator {
    target: BenchmarkTarget,
    runner: Arc<dyn ProcessRunner>,
    client: Arc<dyn ServiceClient>,
    ready: HealthPoller,
    terminated: HealthPoller,
    terminated_deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl BenchmarkOrchestrator {
    pub fn new(
        target: BenchmarkTarget,
        runner: Arc<dyn ProcessRunner>,
        client: Arc<dyn ServiceClient>,
        poll: PollSettings,
        cancel: CancellationToken,
    ) -> Self {
        let poller =
            HealthPoller::new(client.clone(), poll.interval).with_cancellation(cancel.clone());

        Self {
            target,
            runner,
            client,
            ready: poller.clone().with_deadline(poll.ready_deadline),
            terminated: poller.with_deadline(poll.terminated_deadline),
            terminated_deadline: poll.terminated_deadline,
            cancel,
        }
    }

    pub fn target(&self) -> &BenchmarkTarget {
        &self.target
    }

    /// Runs one full cycle for `variant`. Nothing is returned unless every phase succeeded,
    /// and the service process has been reaped by the time this returns.
    pub async fn run_cycle(
        &self,
        variant: &VariantConfig,
        load: &LoadGeneratorConfig,
    ) -> Result<BenchmarkResult, CycleError> {
        let label = variant.label.as_str();

        self.enter(label, Phase::Configuring);
        self.configure(variant).map_err(failed_in(Phase::Configuring))?;

        self.enter(label, Phase::Building);
        self.build(variant).await.map_err(failed_in(Phase::Building))?;

        self.enter(label, Phase::Launching);
        let service = self.launch(variant).map_err(failed_in(Phase::Launching))?;

        if let Err(err) = self.exercise(&service, variant, load).await {
            let command = service.command().to_string();
            match service.kill().await {
                Ok(exit_code) => debug!("{} stopped with exit code {}", command, exit_code),
                Err(kill_err) => warn!("Failed to stop {}\n{}", command, kill_err),
            }
            return Err(err);
        }

        // the service reported DOWN, its process must now exit cleanly
        service
            .wait_for_exit(self.terminated_deadline)
            .await
            .map_err(failed_in(Phase::AwaitingTerminated))?;

        self.enter(label, Phase::Aggregating);
        let result = self
            .aggregate(&variant.log_file)
            .map_err(failed_in(Phase::Aggregating))?;

        self.enter(label, Phase::Done);
        Ok(result)
    }

    fn enter(&self, label: &str, phase: Phase) {
        info!("[{}] {}", label, phase);
    }

    fn configure(&self, variant: &VariantConfig) -> Result<(), PhaseFailure> {
        println!(
            "> setting {}={} for {}",
            self.target.flag_key,
            variant.flag,
            variant.label.green()
        );
        properties::set_property(
            &self.target.properties,
            &self.target.flag_key,
            &variant.flag.to_string(),
        )?;
        Ok(())
    }

    async fn build(&self, variant: &VariantConfig) -> Result<(), PhaseFailure> {
        let build_dir = &self.target.build_dir;
        remove_build_output(build_dir)
            .map_err(PhaseFailure::io("Unable to delete build output", build_dir))?;

        println!("> building {}", variant.label.green());
        self.runner.run(&self.target.build, &variant.sinks).await?;
        println!("\t{}", "✓".green());
        Ok(())
    }

    fn launch(&self, variant: &VariantConfig) -> Result<ServiceHandle, PhaseFailure> {
        if !self.target.binary.is_file() {
            return Err(PhaseFailure::MissingBinary(self.target.binary.clone()));
        }
        // the service runs from its own directory, so a relative path would no longer resolve
        let binary = std::path::absolute(&self.target.binary)
            .map_err(PhaseFailure::io("Unable to resolve binary", &self.target.binary))?;
        let working_dir = binary.parent().unwrap_or(self.target.root.as_path());

        println!("> launching {}", binary.display().to_string().green());
        let service = self
            .runner
            .start(&CommandSpec::new(&binary, working_dir), &variant.sinks)?;
        Ok(service)
    }

    /// Everything the running service takes part in, up to observing it DOWN.
    async fn exercise(
        &self,
        service: &ServiceHandle,
        variant: &VariantConfig,
        load: &LoadGeneratorConfig,
    ) -> Result<(), CycleError> {
        let label = variant.label.as_str();

        self.enter(label, Phase::AwaitingReady);
        self.ready
            .poll_until(HealthState::Up, Some(service.exit_signal()))
            .await
            .map_err(failed_in(Phase::AwaitingReady))?;
        println!("> service is {}", "UP".green());

        self.enter(label, Phase::Benchmarking);
        self.benchmark(variant, load)
            .await
            .map_err(failed_in(Phase::Benchmarking))?;

        self.enter(label, Phase::ShuttingDown);
        self.shutdown(service)
            .await
            .map_err(failed_in(Phase::ShuttingDown))?;

        self.enter(label, Phase::AwaitingTerminated);
        self.terminated
            .poll_until(HealthState::Down, None)
            .await
            .map_err(failed_in(Phase::AwaitingTerminated))?;
        println!("> service is {}", "DOWN".bright_black());

        Ok(())
    }

    async fn benchmark(
        &self,
        variant: &VariantConfig,
        load: &LoadGeneratorConfig,
    ) -> Result<(), PhaseFailure> {
        let log_file = &variant.log_file;
        prepare_log(log_file)?;

        let command = load_command(&self.target.load_command, load, &self.target.root)?
            .timeout(self.target.load_timeout);
        let sinks = LogSinks::combined(log_file.clone());

        for run in 1..=self.target.max_runs {
            if self.cancel.is_cancelled() {
                return Err(PhaseFailure::Cancelled);
            }
            println!(
                "> load testing {} - run {}/{}",
                variant.label.green(),
                run,
                self.target.max_runs
            );
            self.runner.run(&command, &sinks).await?;
        }
        Ok(())
    }

    async fn shutdown(&self, service: &ServiceHandle) -> Result<(), PhaseFailure> {
        // a service that died mid benchmark must not be mistaken for a clean shutdown
        if !service.is_alive() {
            return Err(PhaseFailure::ServiceExited);
        }
        print!("> stopping service");
        self.client.shutdown().await?;
        println!("\t{}", "✓".green());
        Ok(())
    }

    fn aggregate(&self, log_file: &Path) -> Result<BenchmarkResult, PhaseFailure> {
        let log = fs::read_to_string(log_file)
            .map_err(PhaseFailure::io("Unable to read load generator log", log_file))?;
        Ok(parser::parse_results(&log)?)
    }
}

/// Replaces any previous log with one holding a single blank line.
fn prepare_log(log_file: &Path) -> Result<(), PhaseFailure> {
    if log_file.exists() {
        fs::remove_file(log_file)
            .map_err(PhaseFailure::io("Unable to delete previous log", log_file))?;
    }
    fs::write(log_file, LINE_ENDING).map_err(PhaseFailure::io("Unable to create log", log_file))
}
