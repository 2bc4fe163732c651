use std::collections::VecDeque;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::describe_exit;
use crate::process::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::progress::{EventSink, JobEvent, JobPhase, enter_phase};
use crate::telemetry::{ProgressTelemetry, TelemetrySignal};
use crate::{Error, Result};

/// Stream lines kept for the failure report of the publish command.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStage {
    Staging,
    Committing,
    Syncing,
    Publishing,
}

impl PublishStage {
    /// Staging and publishing abort the job; commit and sync failures are only logged.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Staging | Self::Publishing)
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Staging => Some(Self::Committing),
            Self::Committing => Some(Self::Syncing),
            Self::Syncing => Some(Self::Publishing),
            Self::Publishing => None,
        }
    }

    pub fn phase(self) -> JobPhase {
        match self {
            Self::Staging => JobPhase::Stage,
            Self::Committing => JobPhase::Commit,
            Self::Syncing => JobPhase::Sync,
            Self::Publishing => JobPhase::Publish,
        }
    }
}

impl fmt::Display for PublishStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Staging => "staging",
            Self::Committing => "committing",
            Self::Syncing => "syncing",
            Self::Publishing => "publishing",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Running(PublishStage),
    Done,
    Failed(PublishStage),
}

impl PublisherState {
    pub fn start() -> Self {
        Self::Running(PublishStage::Staging)
    }

    pub fn stage(self) -> Option<PublishStage> {
        match self {
            Self::Running(stage) => Some(stage),
            Self::Done | Self::Failed(_) => None,
        }
    }

    /// Applies the outcome of the current stage. Terminal states absorb.
    pub fn advance(self, succeeded: bool) -> Self {
        let Self::Running(stage) = self else {
            return self;
        };
        if !succeeded && stage.is_fatal() {
            return Self::Failed(stage);
        }
        match stage.next() {
            Some(next) => Self::Running(next),
            None => Self::Done,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: PublishStage,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub stages: Vec<StageReport>,
    pub last_throughput: Option<String>,
}

/// Version-control settings for one publish run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsTarget {
    pub program: String,
    pub remote: String,
    pub branch: String,
    pub progress: bool,
}

/// Drives add, commit, sync and publish against the publish root.
pub struct VcsPublisher<'a, R: ProcessRunner + ?Sized> {
    runner: &'a R,
    publish_root: &'a Path,
    target: &'a VcsTarget,
}

impl<'a, R: ProcessRunner + ?Sized> VcsPublisher<'a, R> {
    pub fn new(runner: &'a R, publish_root: &'a Path, target: &'a VcsTarget) -> Self {
        Self {
            runner,
            publish_root,
            target,
        }
    }

    pub fn command_for(&self, stage: PublishStage, folder_name: &str) -> CommandSpec {
        let cmd = CommandSpec::new(&self.target.program, self.publish_root)
            .env("GIT_TERMINAL_PROMPT", "0");
        match stage {
            // `--` keeps a folder named like an option a pathspec.
            PublishStage::Staging => cmd.arg("add").arg("--").arg(folder_name),
            PublishStage::Committing => cmd
                .arg("commit")
                .arg("-m")
                .arg(format!("Add {folder_name}")),
            PublishStage::Syncing => cmd
                .arg("pull")
                .arg(&self.target.remote)
                .arg(&self.target.branch)
                .arg("--rebase"),
            PublishStage::Publishing => {
                let cmd = cmd
                    .arg("push")
                    .arg(&self.target.remote)
                    .arg(&self.target.branch);
                if self.target.progress {
                    cmd.arg("--progress")
                } else {
                    cmd
                }
            }
        }
    }

    pub async fn publish(
        &self,
        folder_name: &str,
        asset_total: u64,
        sink: &dyn EventSink,
    ) -> Result<PublishReport> {
        let mut report = PublishReport::default();
        let mut state = PublisherState::start();

        while let Some(stage) = state.stage() {
            enter_phase(sink, stage.phase());
            let cmd = self.command_for(stage, folder_name);
            debug!(event = "phase.start", phase = stage.phase().as_str(), command = %cmd.display(), "phase.start");
            sink.emit(JobEvent::log(cmd.display()));

            let output = match stage {
                PublishStage::Publishing => {
                    self.run_publish(&cmd, asset_total, sink, &mut report)
                        .await?
                }
                _ => {
                    let output = self.runner.run(&cmd).await?;
                    log_output(&output, sink);
                    output
                }
            };

            report.stages.push(StageReport {
                stage,
                exit_code: output.exit_code,
            });

            let succeeded = output.success();
            if !succeeded && !stage.is_fatal() {
                warn!(
                    event = "stage.tolerated_failure",
                    stage = stage.phase().as_str(),
                    exit_code = ?output.exit_code,
                    "stage.tolerated_failure"
                );
                sink.emit(JobEvent::log(format!(
                    "{stage} returned {}; continuing",
                    describe_exit(&output.exit_code)
                )));
            }

            state = state.advance(succeeded);
            if let PublisherState::Failed(stage) = state {
                let stderr = output.stderr.trim().to_string();
                sink.emit(JobEvent::log(format!(
                    "{stage} failed with {}: {stderr}",
                    describe_exit(&output.exit_code)
                )));
                return Err(Error::StageFailed {
                    stage,
                    exit_code: output.exit_code,
                    stderr,
                });
            }
        }

        info!(event = "publish.done", folder = folder_name, "publish.done");
        Ok(report)
    }

    async fn run_publish(
        &self,
        cmd: &CommandSpec,
        asset_total: u64,
        sink: &dyn EventSink,
        report: &mut PublishReport,
    ) -> Result<ProcessOutput> {
        let mut telemetry = ProgressTelemetry::new(asset_total);
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut stream = self.runner.run_streaming(cmd).await?;

        while let Some(line) = stream.next_line().await {
            sink.emit(JobEvent::log(line.clone()));
            for signal in telemetry.observe(&line) {
                match signal {
                    TelemetrySignal::Throughput(sample) => {
                        report.last_throughput = Some(sample.rate.clone());
                        sink.emit(JobEvent::Throughput(sample));
                    }
                    TelemetrySignal::Progress(progress) => {
                        sink.emit(JobEvent::Progress(progress));
                    }
                }
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let exit_code = stream.wait().await?;
        Ok(ProcessOutput {
            exit_code,
            stdout: String::new(),
            stderr: Vec::from(tail).join("\n"),
        })
    }
}

fn log_output(output: &ProcessOutput, sink: &dyn EventSink) {
    for text in [output.stdout.trim(), output.stderr.trim()] {
        if !text.is_empty() {
            sink.emit(JobEvent::log(text));
        }
    }
}
