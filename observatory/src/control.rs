//! Command leases and best-effort step reporting

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use starwatch_devices::DeviceResult;

/// A device handle plus the lease that serialises commands to it.
///
/// Read-only queries go through [`Controlled::device`]; anything that moves
/// hardware takes a [`Lease`] first so the foreground sequence and the
/// background loops never interleave commands on one subsystem.
#[derive(Debug)]
pub struct Controlled<T: ?Sized> {
    device: Arc<T>,
    lease: Arc<Mutex<()>>,
}

impl<T: ?Sized> Clone for Controlled<T> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            lease: self.lease.clone(),
        }
    }
}

impl<T: ?Sized> Controlled<T> {
    pub fn new(device: Arc<T>) -> Self {
        Self {
            device,
            lease: Arc::new(Mutex::new(())),
        }
    }

    /// Unleased access for status queries
    pub fn device(&self) -> &Arc<T> {
        &self.device
    }

    pub async fn lease(&self) -> Lease<T> {
        let guard = self.lease.clone().lock_owned().await;
        Lease {
            device: self.device.clone(),
            _guard: Some(guard),
        }
    }

    /// Wait up to `wait` for the lease, then proceed without it
    pub async fn lease_within(&self, wait: Duration, what: &str) -> Lease<T> {
        match tokio::time::timeout(wait, self.lease.clone().lock_owned()).await {
            Ok(guard) => Lease {
                device: self.device.clone(),
                _guard: Some(guard),
            },
            Err(_) => {
                tracing::warn!("Overriding command lease on {} after {:?}", what, wait);
                Lease {
                    device: self.device.clone(),
                    _guard: None,
                }
            }
        }
    }

    pub fn is_leased(&self) -> bool {
        self.lease.try_lock().is_err()
    }
}

/// Exclusive command access to a device; released on drop
pub struct Lease<T: ?Sized> {
    device: Arc<T>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl<T: ?Sized> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.device
    }
}

/// Result of one best-effort step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    pub outcome: StepOutcome,
}

/// Per-step outcomes of a bulk sequence (connect, disconnect, shutdown)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceReport {
    pub steps: Vec<StepRecord>,
}

impl SequenceReport {
    pub fn push(&mut self, step: impl Into<String>, outcome: StepOutcome) {
        self.steps.push(StepRecord {
            step: step.into(),
            outcome,
        });
    }

    pub fn skip(&mut self, step: impl Into<String>, reason: impl Into<String>) {
        self.push(step, StepOutcome::Skipped(reason.into()));
    }

    pub fn failures(&self) -> Vec<&StepRecord> {
        self.steps
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Failed(_)))
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }
}

/// Run one step, recording instead of propagating its failure
pub async fn best_effort<F>(report: &mut SequenceReport, step: &str, fut: F)
where
    F: Future<Output = DeviceResult<()>>,
{
    match fut.await {
        Ok(()) => {
            tracing::debug!("{}: done", step);
            report.push(step, StepOutcome::Done);
        }
        Err(e) => {
            tracing::warn!("{} failed: {}", step, e);
            report.push(step, StepOutcome::Failed(e.to_string()));
        }
    }
}
