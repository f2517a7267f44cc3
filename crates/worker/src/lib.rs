//! Deployment worker runtime.
//!
//! One scheduler-managed process per deployed model: serves the query
//! and update endpoints under `/{model_id}`, appends updates to durable
//! per-replica logs, elects a single writer that replays those logs
//! into the model snapshot, and shuts itself down after fifteen idle
//! minutes.

pub mod api;
pub mod idle;
pub mod kernel;
pub mod reporter;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod update_log;
pub mod writer;
