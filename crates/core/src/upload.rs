use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};

use crate::assets::AssetFilter;
use crate::manifest::{build_manifest, manifest_path, write_manifest};
use crate::process::ProcessRunner;
use crate::progress::{EventSink, JobEvent, JobPhase, ProgressEvent, enter_phase};
use crate::publish::{StageReport, VcsPublisher, VcsTarget};
use crate::replicate::{CopyOutcome, replicate_tree};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub owner: String,
    pub repo_name: String,
    pub branch: String,
}

/// One folder to publish. Immutable once created.
#[derive(Debug, Clone)]
pub struct UploadJob {
    id: String,
    source_folder: PathBuf,
    destination_root: PathBuf,
    identity: RemoteIdentity,
}

impl UploadJob {
    pub fn new(
        source_folder: impl Into<PathBuf>,
        destination_root: impl Into<PathBuf>,
        identity: RemoteIdentity,
    ) -> Self {
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4()),
            source_folder: source_folder.into(),
            destination_root: destination_root.into(),
            identity,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_folder(&self) -> &Path {
        &self.source_folder
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    pub fn folder_name(&self) -> Result<String> {
        let name = self
            .source_folder
            .file_name()
            .ok_or_else(|| Error::InvalidConfig {
                message: format!(
                    "source folder has no name: {}",
                    self.source_folder.display()
                ),
            })?;
        name.to_str()
            .map(str::to_string)
            .ok_or_else(|| Error::NonUtf8Path {
                path: self.source_folder.clone(),
            })
    }

    /// `destination_root/<folder name>`; must not exist when the job starts.
    pub fn destination(&self) -> Result<PathBuf> {
        Ok(self.destination_root.join(self.folder_name()?))
    }
}

/// Settings that stay fixed across jobs, handed to the orchestrator up front.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub vcs_program: String,
    pub remote_name: String,
    pub push_progress: bool,
    pub cdn_base: String,
    pub manifest_suffix: String,
    pub manifest_extension: String,
    pub assets: AssetFilter,
    pub failure_samples: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vcs_program: "git".to_string(),
            remote_name: "origin".to_string(),
            push_progress: true,
            cdn_base: "cdn.jsdelivr.net/gh".to_string(),
            manifest_suffix: "_urls".to_string(),
            manifest_extension: "csv".to_string(),
            assets: AssetFilter::default(),
            failure_samples: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Success {
        manifest_path: PathBuf,
        assets: u64,
        copy_failures: u64,
        /// Set when the publish went through but the manifest could not be saved.
        warning: Option<String>,
        /// Exit code of every version-control stage that ran, in order.
        stages: Vec<StageReport>,
        /// Last transfer rate seen while publishing.
        throughput: Option<String>,
    },
    Failure {
        reason: String,
    },
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Runs one job to completion. Every error becomes `JobResult::Failure`.
pub async fn run_upload<R: ProcessRunner + ?Sized>(
    runner: &R,
    config: &PipelineConfig,
    job: &UploadJob,
    sink: &dyn EventSink,
) -> JobResult {
    info!(
        event = "job.start",
        job_id = job.id(),
        source = %job.source_folder().display(),
        destination_root = %job.destination_root().display(),
        "job.start"
    );
    let started = Instant::now();

    let result = match run_pipeline(runner, config, job, sink).await {
        Ok(result) => result,
        Err(e) => {
            error!(event = "job.failed", job_id = job.id(), error = %e, "job.failed");
            sink.emit(JobEvent::log(format!("job aborted: {e}")));
            JobResult::Failure {
                reason: e.to_string(),
            }
        }
    };

    info!(
        event = "job.finish",
        job_id = job.id(),
        success = result.is_success(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "job.finish"
    );
    result
}

async fn run_pipeline<R: ProcessRunner + ?Sized>(
    runner: &R,
    config: &PipelineConfig,
    job: &UploadJob,
    sink: &dyn EventSink,
) -> Result<JobResult> {
    enter_phase(sink, JobPhase::Scan);
    let folder_name = job.folder_name()?;
    let source = job.source_folder().to_path_buf();
    let destination = job.destination()?;

    if !source.is_dir() {
        return Err(Error::InvalidConfig {
            message: format!("source folder is not a directory: {}", source.display()),
        });
    }
    // symlink_metadata also catches dangling links at the destination.
    if std::fs::symlink_metadata(&destination).is_ok() {
        sink.emit(JobEvent::log(format!(
            "{folder_name} already exists under the publish root; upload refused"
        )));
        return Err(Error::DestinationExists { path: destination });
    }

    let asset_total = {
        let filter = config.assets.clone();
        let source = source.clone();
        blocking(move || Ok(filter.count_assets(&source))).await?
    };
    if asset_total == 0 {
        sink.emit(JobEvent::log("source folder contains no assets; nothing to do"));
        return Err(Error::NoAssets { path: source });
    }
    sink.emit(JobEvent::log(format!(
        "source folder {} holds {asset_total} assets",
        source.display()
    )));

    enter_phase(sink, JobPhase::Copy);
    sink.emit(JobEvent::Progress(ProgressEvent::new(
        JobPhase::Copy,
        0,
        asset_total,
    )));
    sink.emit(JobEvent::log(format!(
        "copying into {}",
        destination.display()
    )));
    let copy_started = Instant::now();
    let outcome = {
        let source = source.clone();
        let destination = destination.clone();
        blocking(move || Ok(replicate_tree(&source, &destination))).await?
    };
    report_copy(&outcome, copy_started, config.failure_samples, sink);

    let target = VcsTarget {
        program: config.vcs_program.clone(),
        remote: config.remote_name.clone(),
        branch: job.identity().branch.clone(),
        progress: config.push_progress,
    };
    let report = VcsPublisher::new(runner, job.destination_root(), &target)
        .publish(&folder_name, asset_total, sink)
        .await?;
    sink.emit(JobEvent::log("publish succeeded; building manifest"));

    enter_phase(sink, JobPhase::Manifest);
    let rows = {
        let destination = destination.clone();
        let root = job.destination_root().to_path_buf();
        let identity = job.identity().clone();
        let cdn_base = config.cdn_base.clone();
        let filter = config.assets.clone();
        blocking(move || build_manifest(&destination, &root, &identity, &cdn_base, &filter))
            .await?
    };
    for done in 1..=rows.len() as u64 {
        sink.emit(JobEvent::Progress(ProgressEvent::new(
            JobPhase::Manifest,
            done,
            asset_total,
        )));
    }

    let path = manifest_path(
        job.destination_root(),
        &folder_name,
        &config.manifest_suffix,
        &config.manifest_extension,
    );
    let row_count = rows.len() as u64;
    let written = {
        let path = path.clone();
        blocking(move || write_manifest(&path, &rows)).await
    };
    let warning = match written {
        Ok(()) => {
            sink.emit(JobEvent::log(format!("manifest saved: {}", path.display())));
            None
        }
        Err(e) => {
            let message = format!("manifest save failed: {e}");
            error!(event = "manifest.write_failed", path = %path.display(), error = %e, "manifest.write_failed");
            sink.emit(JobEvent::log(message.clone()));
            Some(message)
        }
    };

    sink.emit(JobEvent::log("job complete"));
    Ok(JobResult::Success {
        manifest_path: path,
        assets: row_count,
        copy_failures: outcome.failures.len() as u64,
        warning,
        stages: report.stages,
        throughput: report.last_throughput,
    })
}

fn report_copy(outcome: &CopyOutcome, started: Instant, samples: usize, sink: &dyn EventSink) {
    let failed = outcome.failures.len() + outcome.directory_failures.len();
    sink.emit(JobEvent::log(format!(
        "copy finished: {} copied, {failed} failed, {:.1}s",
        outcome.success_count,
        started.elapsed().as_secs_f64()
    )));

    let all = outcome.directory_failures.iter().chain(&outcome.failures);
    for failure in all.take(samples) {
        sink.emit(JobEvent::log(format!(
            "copy failed: {} -> {}: {}",
            failure.source.display(),
            failure.destination.display(),
            failure.error
        )));
    }
    if failed > samples {
        sink.emit(JobEvent::log(format!(
            "... {} more copy failures not shown",
            failed - samples
        )));
    }
    debug!(
        event = "copy.summary",
        copied = outcome.success_count,
        failed = failed as u64,
        "copy.summary"
    );
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Worker {
            message: e.to_string(),
        })?
}

/// Owns the runner and configuration and runs jobs one at a time.
pub struct UploadOrchestrator<R> {
    runner: Arc<R>,
    config: Arc<PipelineConfig>,
    gate: Arc<Mutex<()>>,
}

impl<R> Clone for UploadOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            config: Arc::clone(&self.config),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<R: ProcessRunner + 'static> UploadOrchestrator<R> {
    pub fn new(runner: R, config: PipelineConfig) -> Self {
        Self {
            runner: Arc::new(runner),
            config: Arc::new(config),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs `job` on the current task. `JobEvent::Finished` is the last event.
    pub async fn run(&self, job: UploadJob, sink: &dyn EventSink) -> JobResult {
        let _turn = self.gate.lock().await;
        let span = info_span!("job", job_id = job.id(), phase = tracing::field::Empty);
        let result = run_upload(self.runner.as_ref(), &self.config, &job, sink)
            .instrument(span)
            .await;
        sink.emit(JobEvent::Finished {
            result: result.clone(),
        });
        result
    }

    /// Runs `job` on a background task and hands back its event stream.
    pub fn spawn(&self, job: UploadJob) -> UploadHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let task = tokio::spawn(async move { this.run(job, &tx).await });
        UploadHandle { events: rx, task }
    }
}

pub struct UploadHandle {
    pub events: mpsc::UnboundedReceiver<JobEvent>,
    task: JoinHandle<JobResult>,
}

impl UploadHandle {
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    pub async fn join(self) -> JobResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => JobResult::Failure {
                reason: format!("worker failed: {e}"),
            },
        }
    }
}
