use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::upload::JobResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Scan,
    Copy,
    Stage,
    Commit,
    Sync,
    Publish,
    Manifest,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Copy => "copy",
            Self::Stage => "stage",
            Self::Commit => "commit",
            Self::Sync => "sync",
            Self::Publish => "publish",
            Self::Manifest => "manifest",
        }
    }
}

/// Completion ratio within one phase. `done <= total` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: JobPhase,
    pub done: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(phase: JobPhase, done: u64, total: u64) -> Self {
        Self {
            phase,
            done: done.min(total),
            total,
        }
    }
}

/// Most recent transfer rate reported by the publish command, e.g. `"1.2 MiB/s"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub rate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Log { at: DateTime<Utc>, message: String },
    Phase { phase: JobPhase },
    Progress(ProgressEvent),
    Throughput(ThroughputSample),
    Finished { result: JobResult },
}

impl JobEvent {
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            at: Utc::now(),
            message: message.into(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

impl EventSink for UnboundedSender<JobEvent> {
    fn emit(&self, event: JobEvent) {
        // A dropped receiver means nobody is watching; the job keeps going.
        let _ = self.send(event);
    }
}

/// Announces `phase` to observers and tags the enclosing `job` span with it,
/// so every log line written from here on names the phase.
pub(crate) fn enter_phase(sink: &dyn EventSink, phase: JobPhase) {
    tracing::Span::current().record("phase", phase.as_str());
    sink.emit(JobEvent::Phase { phase });
}
