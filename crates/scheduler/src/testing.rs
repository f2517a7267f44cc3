//! In-memory scheduler used by tests across the workspace.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use mb_domain::error::Result;

use crate::client::{Allocation, JobInfo, SchedulerClient, ServiceInfo};
use crate::jobspec::JobSpec;

/// A scheduler stub that records every submission and deletion.
#[derive(Default)]
pub struct MockScheduler {
    jobs: Mutex<HashMap<String, JobInfo>>,
    allocations: Mutex<Vec<Allocation>>,
    services: Mutex<Vec<ServiceInfo>>,
    submitted: Mutex<Vec<JobSpec>>,
    deleted: Mutex<Vec<String>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) the scheduler's view of a job.
    pub fn set_job_status(&self, job_id: &str, status: &str) {
        self.jobs.lock().insert(
            job_id.to_string(),
            JobInfo {
                id: job_id.to_string(),
                status: status.to_string(),
            },
        );
    }

    /// Make the job unknown to the scheduler.
    pub fn forget_job(&self, job_id: &str) {
        self.jobs.lock().remove(job_id);
    }

    pub fn set_running_allocation(&self, job_id: &str, cpu_mhz: u64) {
        self.allocations.lock().push(Allocation {
            job_id: job_id.to_string(),
            client_status: "running".to_string(),
            cpu_mhz: HashMap::from([("main".to_string(), cpu_mhz)]),
        });
    }

    pub fn submitted_jobs(&self) -> Vec<JobSpec> {
        self.submitted.lock().clone()
    }

    /// How many times `job_id` was deleted.
    pub fn delete_count(&self, job_id: &str) -> usize {
        self.deleted.lock().iter().filter(|j| *j == job_id).count()
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn submit_job(&self, spec: &JobSpec) -> Result<String> {
        self.submitted.lock().push(spec.clone());
        self.set_job_status(&spec.name, "running");
        Ok(spec.name.clone())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.deleted.lock().push(job_id.to_string());
        self.jobs.lock().remove(job_id);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>> {
        Ok(self.jobs.lock().get(job_id).cloned())
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.services.lock().clone())
    }

    async fn get_service_info(&self, service_name: &str) -> Result<Option<ServiceInfo>> {
        Ok(self
            .services
            .lock()
            .iter()
            .find(|s| s.name == service_name)
            .cloned())
    }

    async fn list_allocations(&self) -> Result<Vec<Allocation>> {
        Ok(self.allocations.lock().clone())
    }
}
