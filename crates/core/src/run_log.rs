//! Per-job NDJSON log.
//!
//! While a [`JobLog`] is open, every tracing line of the process lands in its
//! file. Lines logged inside the orchestrator's `job` span carry that span's
//! `job_id` and current `phase`. The job's own [`JobEvent`]s are written to
//! the same file as `"record": "job_event"` lines, stamped the same way.

use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::progress::{EventSink, JobEvent, JobPhase};

static ACTIVE: OnceLock<ActiveLog> = OnceLock::new();
static TRACING: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Publish,
    Manifest,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Manifest => "manifest",
        }
    }
}

/// The file log lines currently go to; `None` between jobs.
#[derive(Debug, Default)]
struct ActiveLog {
    file: Mutex<Option<LineWriter<File>>>,
}

impl ActiveLog {
    fn lock(&self) -> MutexGuard<'_, Option<LineWriter<File>>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ActiveLogWriter(MutexGuard<'static, Option<LineWriter<File>>>);

impl Write for ActiveLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for &'static ActiveLog {
    type Writer = ActiveLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        let log: &'static ActiveLog = *self;
        ActiveLogWriter(log.lock())
    }
}

fn build_env_filter_from(app_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    app_log
        .or(rust_log)
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("debug"))
}

/// Installs the process-wide json subscriber once. `CDNPUSH_LOG` wins over
/// `RUST_LOG`; the default level is `debug`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let active: &'static ActiveLog = ACTIVE.get_or_init(ActiveLog::default);
        let filter = build_env_filter_from(
            std::env::var("CDNPUSH_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(active);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

#[derive(Serialize)]
struct EventRecord<'a> {
    timestamp: String,
    record: &'static str,
    job_id: &'a str,
    phase: Option<JobPhase>,
    event: &'a JobEvent,
}

/// Log file of one job. Only one can be open per process; dropping it flushes
/// the file and detaches it.
#[derive(Debug)]
pub struct JobLog {
    job_id: String,
    path: PathBuf,
    phase: Mutex<Option<JobPhase>>,
}

impl JobLog {
    /// Opens `<logs>/run-<kind>-<utc>-<job_id>.ndjson`, where `<logs>` is
    /// `CDNPUSH_LOG_DIR` or `<data_dir>/logs`.
    pub fn open(kind: RunKind, job_id: &str, data_dir: &Path) -> io::Result<Self> {
        init_tracing();

        let dir = match std::env::var("CDNPUSH_LOG_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => data_dir.join("logs"),
        };
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(log_file_name(kind, job_id, Utc::now()));

        let mut slot = ACTIVE.get_or_init(ActiveLog::default).lock();
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "another job log is open",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        *slot = Some(LineWriter::new(file));

        Ok(Self {
            job_id: job_id.to_string(),
            path,
            phase: Mutex::new(None),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JobLog {
    fn emit(&self, event: JobEvent) {
        let phase = {
            let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if let JobEvent::Phase { phase } = &event {
                *current = Some(*phase);
            }
            *current
        };
        let record = EventRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record: "job_event",
            job_id: &self.job_id,
            phase,
            event: &event,
        };
        let Ok(mut line) = serde_json::to_vec(&record) else {
            return;
        };
        line.push(b'\n');

        // No tracing while the slot is held: the subscriber writes through it.
        if let Some(active) = ACTIVE.get()
            && let Some(file) = active.lock().as_mut()
        {
            let _ = file.write_all(&line);
        }
    }
}

impl Drop for JobLog {
    fn drop(&mut self) {
        let Some(active) = ACTIVE.get() else {
            return;
        };
        if let Some(mut file) = active.lock().take() {
            let _ = file.flush();
            let _ = file.get_ref().sync_all();
        }
    }
}

fn log_file_name(kind: RunKind, job_id: &str, at: DateTime<Utc>) -> String {
    let id: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "run-{}-{}-{id}.ndjson",
        kind.as_str(),
        at.format("%Y%m%dT%H%M%SZ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::enter_phase;

    #[test]
    fn env_filter_precedence_is_app_then_rust_log_then_default() {
        assert_eq!(build_env_filter_from(Some("info"), Some("debug")).to_string(), "info");
        assert_eq!(build_env_filter_from(None, Some("warn")).to_string(), "warn");
        assert_eq!(build_env_filter_from(None, None).to_string(), "debug");
    }

    #[test]
    fn file_name_names_kind_and_sanitized_job_id() {
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            log_file_name(RunKind::Manifest, "job 1/x", at),
            "run-manifest-20260304T050607Z-job_1_x.ndjson"
        );
    }

    #[test]
    fn job_log_stamps_job_id_and_phase() {
        let temp = tempfile::tempdir().unwrap();
        let log = JobLog::open(RunKind::Publish, "job_test", temp.path()).unwrap();
        assert_eq!(log.path().parent(), Some(temp.path().join("logs").as_path()));
        let second = JobLog::open(RunKind::Publish, "job_other", temp.path()).unwrap_err();
        assert_eq!(second.kind(), io::ErrorKind::AlreadyExists);

        {
            let span = tracing::info_span!(
                "job",
                job_id = "job_test",
                phase = tracing::field::Empty
            );
            let _entered = span.enter();
            log.emit(JobEvent::log("scanning"));
            enter_phase(&log, JobPhase::Copy);
            tracing::warn!(event = "job_log.check", "job_log.check");
            log.emit(JobEvent::log("copying"));
        }

        let path = log.path().to_path_buf();
        drop(log);

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        let events: Vec<&serde_json::Value> =
            lines.iter().filter(|v| v["record"] == "job_event").collect();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|v| v["job_id"] == "job_test"));
        assert!(events[0]["phase"].is_null());
        assert_eq!(events[1]["event"]["type"], "phase");
        assert_eq!(events[2]["phase"], "copy");
        assert_eq!(events[2]["event"]["message"], "copying");

        let traced = lines
            .iter()
            .find(|v| v["fields"]["event"] == "job_log.check")
            .expect("tracing line in job log");
        assert_eq!(traced["span"]["job_id"], "job_test");
        assert_eq!(traced["span"]["phase"], "copy");
    }
}
