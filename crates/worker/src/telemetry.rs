//! Sampled prediction telemetry.
//!
//! Every 1-in-N predictions is appended as one JSON line under
//! `{deployment_dir}/telemetry/{replica_uuid}.jsonl`. Telemetry is
//! best-effort: a write failure is logged and never fails the request.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct TelemetryEvent<'a> {
    at: chrono::DateTime<Utc>,
    query: &'a str,
    top_k: usize,
    references: usize,
    latency_ms: u64,
}

pub struct TelemetryWriter {
    stream: Mutex<Option<std::fs::File>>,
    sample_rate: u32,
    counter: AtomicU64,
}

impl TelemetryWriter {
    pub fn open(deployment_dir: &Path, sample_rate: u32) -> Self {
        let stream = (|| {
            let dir = deployment_dir.join("telemetry");
            std::fs::create_dir_all(&dir).ok()?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{}.jsonl", Uuid::new_v4())))
                .ok()
        })();
        if stream.is_none() {
            tracing::warn!("telemetry writer disabled (cannot open log file)");
        }
        Self {
            stream: Mutex::new(stream),
            sample_rate: sample_rate.max(1),
            counter: AtomicU64::new(0),
        }
    }

    /// Record one prediction if it falls on the sampling boundary.
    pub fn record(&self, query: &str, top_k: usize, references: usize, latency_ms: u64) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        if n % self.sample_rate as u64 != 0 {
            return;
        }
        let event = TelemetryEvent {
            at: Utc::now(),
            query,
            top_k,
            references,
            latency_ms,
        };
        let mut guard = self.stream.lock();
        if let Some(stream) = guard.as_mut() {
            match serde_json::to_vec(&event) {
                Ok(mut line) => {
                    line.push(b'\n');
                    if let Err(e) = stream.write_all(&line).and_then(|_| stream.flush()) {
                        tracing::debug!(error = %e, "telemetry write failed");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "telemetry encode failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_one_in_n() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TelemetryWriter::open(dir.path(), 5);
        for _ in 0..10 {
            writer.record("q", 3, 3, 1);
        }
        let telemetry_dir = dir.path().join("telemetry");
        let file = std::fs::read_dir(&telemetry_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let text = std::fs::read_to_string(file).unwrap();
        assert_eq!(text.lines().count(), 2, "events 0 and 5 of 10");
    }
}
