//! Runs VM jobs in the background, at most one per VM.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{record_fault, JobReport, VmJob};
use crate::model::{OperationKind, ProvisionRequest};
use crate::store::StateStore;

/// Bookkeeping for one running job.
struct JobHandle {
    kind: OperationKind,
    started_at: DateTime<Utc>,
    cancel: watch::Sender<bool>,
}

/// Snapshot of a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveJob {
    pub vm_id: String,
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
}

type LiveJobs = Arc<Mutex<HashMap<String, JobHandle>>>;

fn lock(live: &LiveJobs) -> MutexGuard<'_, HashMap<String, JobHandle>> {
    live.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the job's entry when the supervising task ends, however it ends.
struct LiveJobGuard {
    live: LiveJobs,
    vm_id: String,
}

impl Drop for LiveJobGuard {
    fn drop(&mut self) {
        lock(&self.live).remove(&self.vm_id);
    }
}

/// Returned by [`JobScheduler::submit`] and [`JobReservation::start`]; resolves when the job is over.
#[derive(Debug)]
pub struct JobTicket {
    vm_id: String,
    kind: OperationKind,
    report: oneshot::Receiver<JobReport>,
}

impl JobTicket {
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// `None` only if the supervising task was torn down with the runtime.
    pub async fn wait(self) -> Option<JobReport> {
        self.report.await.ok()
    }
}

/// A VM claimed by [`JobScheduler::reserve`] that has no job running yet.
pub struct JobReservation {
    scheduler: JobScheduler,
    kind: OperationKind,
    cancel: watch::Receiver<bool>,
    guard: LiveJobGuard,
}

impl JobReservation {
    pub fn vm_id(&self) -> &str {
        &self.guard.vm_id
    }

    /// Run `request` on the reserved VM. A cancel sent while reserved stops it at once.
    pub fn start(self, request: ProvisionRequest) -> JobTicket {
        let JobReservation {
            scheduler,
            kind,
            cancel,
            guard,
        } = self;
        debug_assert_eq!(request.vm_id, guard.vm_id);
        debug_assert_eq!(request.kind, kind);

        let vm_id = guard.vm_id.clone();
        let (report_tx, report_rx) = oneshot::channel();
        let store = Arc::clone(&scheduler.store);
        let job = VmJob::new(request, Arc::clone(&store), Arc::clone(&scheduler.config), cancel);

        info!("Scheduled VM {} for {}", kind.noun(), vm_id);

        tokio::spawn(async move {
            let started = Instant::now();
            let report = match tokio::spawn(job.run()).await {
                Ok(report) => report,
                Err(e) => {
                    let reason = if e.is_panic() {
                        "job panicked"
                    } else {
                        "job was aborted"
                    };
                    error!("VM {} for {}: {}", kind.noun(), guard.vm_id, reason);
                    JobReport {
                        vm_id: guard.vm_id.clone(),
                        kind,
                        final_status: record_fault(store.as_ref(), &guard.vm_id, kind, reason)
                            .await,
                        elapsed: started.elapsed(),
                    }
                }
            };

            // The VM must be free again by the time the submitter hears back.
            drop(guard);
            let _ = report_tx.send(report);
        });

        JobTicket {
            vm_id,
            kind,
            report: report_rx,
        }
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn StateStore>,
    config: Arc<OrchestratorConfig>,
    live: LiveJobs,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn StateStore>, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            store,
            config,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Claim `vm_id` for a job of `kind` without starting it yet.
    ///
    /// The claim shows up in [`live_jobs`](Self::live_jobs) and answers
    /// [`cancel`](Self::cancel) right away. Dropping the reservation releases it.
    /// Fails with [`OrchestratorError::Busy`] when that VM already has a live job.
    pub fn reserve(&self, vm_id: &str, kind: OperationKind) -> Result<JobReservation> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut live = lock(&self.live);
            if live.contains_key(vm_id) {
                warn!("Rejecting {} for VM {}: job already in progress", kind, vm_id);
                return Err(OrchestratorError::Busy(vm_id.to_string()));
            }
            live.insert(
                vm_id.to_string(),
                JobHandle {
                    kind,
                    started_at: Utc::now(),
                    cancel: cancel_tx,
                },
            );
        }

        Ok(JobReservation {
            scheduler: self.clone(),
            kind,
            cancel: cancel_rx,
            guard: LiveJobGuard {
                live: Arc::clone(&self.live),
                vm_id: vm_id.to_string(),
            },
        })
    }

    /// Start a job for `request.vm_id` and return without waiting for it.
    ///
    /// Fails with [`OrchestratorError::Busy`] when that VM already has a live job.
    pub fn submit(&self, request: ProvisionRequest) -> Result<JobTicket> {
        let reservation = self.reserve(&request.vm_id, request.kind)?;
        Ok(reservation.start(request))
    }

    pub fn is_busy(&self, vm_id: &str) -> bool {
        lock(&self.live).contains_key(vm_id)
    }

    /// Running jobs, oldest first.
    pub fn live_jobs(&self) -> Vec<LiveJob> {
        let mut jobs: Vec<LiveJob> = lock(&self.live)
            .iter()
            .map(|(vm_id, handle)| LiveJob {
                vm_id: vm_id.clone(),
                kind: handle.kind,
                started_at: handle.started_at,
            })
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Ask the VM's live job to kill its script. Returns `false` when there is none.
    pub fn cancel(&self, vm_id: &str) -> bool {
        match lock(&self.live).get(vm_id) {
            Some(handle) => {
                info!("Cancelling VM {} for {}", handle.kind.noun(), vm_id);
                handle.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }
}
