//! Progress and throughput signals recovered from the publish command's
//! diagnostic stream.
//!
//! Two line shapes are recognized:
//!
//! - throughput: any whitespace token ending in `/s`, e.g. `| 2.00 MiB/s`;
//!   the last one on the line wins.
//! - object counts: `Writing objects: <pct> (<done>/<total>)`; `done` is
//!   rescaled onto the job's asset total.
//!
//! Anything else, including malformed counts, produces no signal.

use crate::progress::{JobPhase, ProgressEvent, ThroughputSample};

const OBJECT_COUNT_LABEL: &str = "Writing objects:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetrySignal {
    Throughput(ThroughputSample),
    Progress(ProgressEvent),
}

/// Line classifier for one publish invocation. The only state kept is the
/// last reported progress, so emitted progress never goes backwards.
#[derive(Debug)]
pub struct ProgressTelemetry {
    asset_total: u64,
    last_done: Option<u64>,
}

impl ProgressTelemetry {
    pub fn new(asset_total: u64) -> Self {
        Self {
            asset_total,
            last_done: None,
        }
    }

    pub fn asset_total(&self) -> u64 {
        self.asset_total
    }

    pub fn observe(&mut self, line: &str) -> Vec<TelemetrySignal> {
        let mut signals = Vec::new();

        if let Some(rate) = parse_throughput(line) {
            signals.push(TelemetrySignal::Throughput(ThroughputSample { rate }));
        }

        if let Some((done, total)) = parse_object_counts(line)
            && let Some(scaled) = scale_progress(done, total, self.asset_total)
            && self.last_done.is_none_or(|last| scaled >= last)
        {
            self.last_done = Some(scaled);
            signals.push(TelemetrySignal::Progress(ProgressEvent::new(
                JobPhase::Publish,
                scaled,
                self.asset_total,
            )));
        }

        signals
    }
}

pub fn parse_throughput(line: &str) -> Option<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let idx = tokens
        .iter()
        .rposition(|t| t.trim_end_matches([',', '.']).ends_with("/s"))?;
    let rate = tokens[idx].trim_end_matches([',', '.']);

    if rate.chars().any(|c| c.is_ascii_digit()) {
        return Some(rate.to_string());
    }
    match idx.checked_sub(1).map(|i| tokens[i]) {
        Some(number) if is_number(number) => Some(format!("{number} {rate}")),
        _ => Some(rate.to_string()),
    }
}

fn is_number(token: &str) -> bool {
    !token.is_empty()
        && token.chars().any(|c| c.is_ascii_digit())
        && token.chars().all(|c| c.is_ascii_digit() || c == '.')
}

pub fn parse_object_counts(line: &str) -> Option<(u64, u64)> {
    let (_, rest) = line.split_once(OBJECT_COUNT_LABEL)?;
    let (_, rest) = rest.split_once('(')?;
    let (inner, _) = rest.split_once(')')?;
    let (done, total) = inner.split_once('/')?;
    let done = done.trim().parse().ok()?;
    let total = total.trim().parse().ok()?;
    Some((done, total))
}

/// `min(asset_total, done * asset_total / total)`; `None` when `total` is zero.
pub fn scale_progress(done: u64, total: u64, asset_total: u64) -> Option<u64> {
    if total == 0 {
        return None;
    }
    let scaled = u128::from(done) * u128::from(asset_total) / u128::from(total);
    Some(scaled.min(u128::from(asset_total)) as u64)
}
