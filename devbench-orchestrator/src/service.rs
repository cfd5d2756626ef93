use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{OperationKind, ProvisionRequest, VmRecord, VmStatus};
use crate::scheduler::{JobScheduler, JobTicket, LiveJob};
use crate::store::StateStore;

/// Devbench lifecycle operations on top of a store and a job scheduler.
#[derive(Clone)]
pub struct DevbenchService {
    store: Arc<dyn StateStore>,
    scheduler: JobScheduler,
}

impl DevbenchService {
    pub fn new(store: Arc<dyn StateStore>, config: Arc<OrchestratorConfig>) -> Self {
        let scheduler = JobScheduler::new(Arc::clone(&store), config);
        Self { store, scheduler }
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Record a new devbench and start provisioning it in the background.
    ///
    /// The returned ticket resolves once the create job has finished.
    #[instrument(skip(self))]
    pub async fn create_devbench(&self, name: &str, owner: &str) -> Result<(VmRecord, JobTicket)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "VM name cannot be empty".to_string(),
            ));
        }
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "owner cannot be empty".to_string(),
            ));
        }

        let mut record = VmRecord::new(name, owner);
        record.append_log(format!("VM creation requested by {}", owner));
        self.store.insert_record(&record).await?;
        info!("Created devbench {} ({}) for {}", record.name, record.id, owner);

        let request = ProvisionRequest::create(&record, self.scheduler.config());
        let ticket = self.scheduler.submit(request)?;

        Ok((record, ticket))
    }

    /// Re-run the script's `activate` step for an existing devbench.
    ///
    /// The VM is claimed before the record is touched, so a rejected call
    /// never writes.
    #[instrument(skip(self))]
    pub async fn activate_devbench(&self, id: &str, owner: &str) -> Result<(VmRecord, JobTicket)> {
        self.owned_devbench(id, owner).await?;
        let reservation = self.scheduler.reserve(id, OperationKind::Activate)?;

        // Re-read under the reservation; a job that just finished may have saved since.
        let mut record = self.owned_devbench(id, owner).await?;
        record.status = OperationKind::Activate.initial_status();
        record.append_log(format!("VM activation requested by {}", owner));
        record.touch();
        self.store.save_record(&record).await?;

        let request = ProvisionRequest::activate(&record, self.scheduler.config());
        let ticket = reservation.start(request);

        Ok((record, ticket))
    }

    async fn owned_devbench(&self, id: &str, owner: &str) -> Result<VmRecord> {
        let record = self.get_devbench(id).await?;
        if record.owner != owner {
            // Indistinguishable from a missing record to the caller.
            warn!("{} tried to activate devbench {} owned by {}", owner, id, record.owner);
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        Ok(record)
    }

    pub async fn get_devbench(&self, id: &str) -> Result<VmRecord> {
        self.store
            .get_record(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    /// Newest first; every devbench when `owner` is `None`.
    pub async fn list_devbenches(&self, owner: Option<&str>) -> Result<Vec<VmRecord>> {
        Ok(self.store.list_records(owner).await?)
    }

    /// Rendered log lines and the current status.
    pub async fn get_logs(&self, id: &str) -> Result<(Vec<String>, VmStatus)> {
        let record = self.get_devbench(id).await?;
        Ok((record.log_lines(), record.status))
    }

    /// Remove a devbench, cancelling its job first if one is running.
    #[instrument(skip(self))]
    pub async fn delete_devbench(&self, id: &str) -> Result<()> {
        if self.scheduler.cancel(id) {
            info!("Cancelled running job before deleting devbench {}", id);
        }
        self.store.delete_record(id).await?;
        info!("Deleted devbench {}", id);
        Ok(())
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn live_jobs(&self) -> Vec<LiveJob> {
        self.scheduler.live_jobs()
    }
}
