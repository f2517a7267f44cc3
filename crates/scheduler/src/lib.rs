//! Job lifecycle manager.
//!
//! Owns every interaction with the external cluster scheduler: job
//! submission and deletion with bounded retry, the signed-license gate,
//! and the periodic reconciler that keeps Model rows honest about what
//! the scheduler actually runs.

pub mod client;
pub mod jobspec;
pub mod license;
pub mod reconcile;
pub mod testing;

pub use client::{Allocation, HttpSchedulerClient, JobInfo, SchedulerClient, ServiceInfo};
pub use jobspec::JobSpec;
pub use license::{LicenseGate, LicenseInfo};
pub use reconcile::Reconciler;
