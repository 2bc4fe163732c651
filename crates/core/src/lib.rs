mod assets;
pub mod config;
mod error;
pub mod manifest;
pub mod process;
mod progress;
mod publish;
mod replicate;
pub mod run_log;
pub mod telemetry;
mod upload;

pub const APP_NAME: &str = "cdnpush";

pub use assets::{AssetFilter, DEFAULT_ASSET_EXTENSIONS};
pub use error::{Error, Result};
pub use manifest::{ManifestRow, build_manifest, manifest_path, write_manifest};
pub use process::{
    CommandSpec, ProcessOutput, ProcessRunner, ProcessStream, ScriptedProcessRunner,
    ScriptedResponse, SystemProcessRunner,
};
pub use progress::{EventSink, JobEvent, JobPhase, ProgressEvent, ThroughputSample};
pub use publish::{
    PublishReport, PublishStage, PublisherState, StageReport, VcsPublisher, VcsTarget,
};
pub use replicate::{CopyFailure, CopyOutcome, replicate_tree};
pub use telemetry::{ProgressTelemetry, TelemetrySignal};
pub use upload::{
    JobResult, PipelineConfig, RemoteIdentity, UploadHandle, UploadJob, UploadOrchestrator,
    run_upload,
};
