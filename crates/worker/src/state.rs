//! Shared worker state passed to all handlers.

use std::sync::Arc;

use parking_lot::RwLock;

use mb_domain::config::WorkerConfig;
use mb_llm::LlmProvider;

use crate::idle::IdleWatchdog;
use crate::kernel::{ModelKernel, TokenClassifier};
use crate::telemetry::TelemetryWriter;
use crate::update_log::UpdateLogger;
use crate::writer::PendingUpdates;

/// Swappable kernel reference: replicas replace the inner Arc when the
/// writer publishes a new snapshot.
pub struct KernelHandle {
    inner: RwLock<Arc<dyn ModelKernel>>,
}

impl KernelHandle {
    pub fn new(kernel: Arc<dyn ModelKernel>) -> Self {
        Self {
            inner: RwLock::new(kernel),
        }
    }

    pub fn get(&self) -> Arc<dyn ModelKernel> {
        self.inner.read().clone()
    }

    pub fn replace(&self, kernel: Arc<dyn ModelKernel>) {
        *self.inner.write() = kernel;
    }
}

#[derive(Clone)]
pub struct WorkerState {
    pub config: Arc<WorkerConfig>,
    pub kernel: Arc<KernelHandle>,
    /// Token classifier composed in front of retrieval, when configured.
    pub guardrail: Option<Arc<dyn TokenClassifier>>,
    pub update_log: Arc<UpdateLogger>,
    pub telemetry: Arc<TelemetryWriter>,
    pub idle: Arc<IdleWatchdog>,
    pub pending: Arc<PendingUpdates>,
    /// Answer generation; `None` disables the `generate_answer` option.
    pub llm: Option<Arc<dyn LlmProvider>>,
    /// SHA-256 of the job token (constant-time compared per request).
    pub job_token_hash: Arc<Vec<u8>>,
    /// Whether this replica holds the writer lock.
    pub is_writer: bool,
}
