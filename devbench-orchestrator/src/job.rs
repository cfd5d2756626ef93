//! One run of the provisioning script against one devbench.
//!
//! A [`VmJob`] owns the record's status, log and connection details for the
//! duration of its run. Every output line is appended to the log, parsed for
//! signals and persisted before the next line is read. The process outcome
//! decides the terminal status:
//!
//! | outcome                            | status   |
//! |------------------------------------|----------|
//! | exit code 0                        | `Ready`  |
//! | non-zero exit, signal              | `Failed` |
//! | timeout, spawn failure             | `Failed` |
//! | cancelled                          | `Failed` |
//! | output read fault, panic           | `Error`  |
//! | record unreadable after one retry  | `Error`  |
//!
//! If the record disappears from the store mid-run the job kills the script
//! and stops without writing anything further.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use devbench_core::{spawn_streaming, CommandSpec, ProcessOutcome, StreamingCommand, VmError};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::log_parser::{parse_line, ParsedSignal};
use crate::model::{OperationKind, ProvisionRequest, VmRecord, VmStatus};
use crate::store::{StateStore, StoreError};

/// Status a successful run ends in, for both create and activate.
pub const SUCCESS_STATUS: VmStatus = VmStatus::Ready;

/// Pause before the single retry of a failed initial record load.
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(250);

/// What a finished job reports back to whoever submitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub vm_id: String,
    pub kind: OperationKind,
    /// `None` when the record vanished before a terminal status could be written.
    pub final_status: Option<VmStatus>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Vanished,
}

/// In-memory state of a run.
struct RunState {
    record: VmRecord,
    completion_observed: bool,
    tail: VecDeque<String>,
    tail_limit: usize,
}

impl RunState {
    fn new(record: VmRecord, tail_limit: usize) -> Self {
        Self {
            record,
            completion_observed: false,
            tail: VecDeque::with_capacity(tail_limit),
            tail_limit,
        }
    }

    fn remember(&mut self, line: &str) {
        if self.tail_limit == 0 {
            return;
        }
        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    fn tail_text(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

pub struct VmJob {
    request: ProvisionRequest,
    store: Arc<dyn StateStore>,
    config: Arc<OrchestratorConfig>,
    cancel: watch::Receiver<bool>,
}

impl VmJob {
    pub fn new(
        request: ProvisionRequest,
        store: Arc<dyn StateStore>,
        config: Arc<OrchestratorConfig>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            request,
            store,
            config,
            cancel,
        }
    }

    fn command_spec(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.script_path)
            .args(self.request.args.iter().cloned())
            .helper_path(&self.config.helper_path)
            .timeout(self.request.timeout);
        if let Some(dir) = &self.config.working_dir {
            spec = spec.current_dir(dir);
        }
        spec
    }

    #[instrument(skip(self), fields(vm_id = %self.request.vm_id, kind = %self.request.kind))]
    pub async fn run(mut self) -> JobReport {
        let started = Instant::now();
        info!(
            "Starting VM {} - ID: {}, Name: {}, User: {}",
            self.request.kind.noun(),
            self.request.vm_id,
            self.request.vm_name,
            self.request.username
        );

        let final_status = self.drive(started).await;

        match final_status {
            Some(status) => info!(
                "Completed VM {} for {} with status: {}",
                self.request.kind.noun(),
                self.request.vm_id,
                status
            ),
            None => warn!(
                "VM {} for {} ended without a final status",
                self.request.kind.noun(),
                self.request.vm_id
            ),
        }

        JobReport {
            vm_id: self.request.vm_id.clone(),
            kind: self.request.kind,
            final_status,
            elapsed: started.elapsed(),
        }
    }

    async fn drive(&mut self, started: Instant) -> Option<VmStatus> {
        let record = match self.load_record().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("VM {} not found in store, nothing to do", self.request.vm_id);
                return None;
            }
            Err(e) => {
                error!("Could not load VM {}: {}", self.request.vm_id, e);
                let reason = format!("could not load record: {}", e);
                return record_fault(
                    self.store.as_ref(),
                    &self.request.vm_id,
                    self.request.kind,
                    &reason,
                )
                .await;
            }
        };

        let mut state = RunState::new(record, self.config.details_tail_lines);
        state.record.append_log(format!(
            "Starting VM {} for {}",
            self.request.kind.noun(),
            self.request.vm_name
        ));
        if self.persist(&mut state.record).await == Step::Vanished {
            return None;
        }

        let spec = self.command_spec();
        info!("Executing command: {}", spec.command_line());

        let mut command = match spawn_streaming(&spec) {
            Ok(command) => command,
            Err(e) => {
                let (status, message) = self.start_failure(&e);
                return self.finish(&mut state, status, message, None).await;
            }
        };

        debug!("Script running with pids {:?}", command.pids());

        if self.stream_output(&mut state, &mut command).await == Step::Vanished {
            command.kill();
            return None;
        }

        let finished = tokio::select! {
            outcome = command.wait() => Some(outcome),
            _ = cancelled(&mut self.cancel) => None,
        };
        let outcome = finished.unwrap_or_else(|| {
            command.kill();
            ProcessOutcome::Killed
        });

        let (status, message, with_tail) = self.conclude(&state, &outcome, started.elapsed());
        let tail = with_tail.then(|| state.tail_text());
        self.finish(&mut state, status, message, tail).await
    }

    /// The initial read, retried once when the backend fails.
    async fn load_record(&self) -> Result<Option<VmRecord>, StoreError> {
        match self.store.get_record(&self.request.vm_id).await {
            Err(StoreError::Backend(e)) => {
                warn!("Retrying load of VM {} after: {}", self.request.vm_id, e);
                tokio::time::sleep(LOAD_RETRY_DELAY).await;
                self.store.get_record(&self.request.vm_id).await
            }
            loaded => loaded,
        }
    }

    /// A script that never started is `Failed`; anything else going wrong first is ours.
    fn start_failure(&self, err: &VmError) -> (VmStatus, String) {
        if err.is_spawn_failure() {
            (
                VmStatus::Failed,
                format!("Failed to start provisioning script: {}", err),
            )
        } else {
            (
                VmStatus::Error,
                format!(
                    "Unexpected error during VM {}: {}",
                    self.request.kind.noun(),
                    err
                ),
            )
        }
    }

    async fn stream_output(&mut self, state: &mut RunState, command: &mut StreamingCommand) -> Step {
        loop {
            let next = tokio::select! {
                line = command.next_line() => Some(line),
                _ = cancelled(&mut self.cancel) => None,
            };

            let Some(line) = next else {
                info!("Cancellation requested for VM {}", self.request.vm_id);
                command.kill();
                return Step::Continue;
            };
            let Some(line) = line else {
                return Step::Continue;
            };

            if self.process_line(state, &line).await == Step::Vanished {
                return Step::Vanished;
            }
        }
    }

    async fn process_line(&self, state: &mut RunState, raw: &str) -> Step {
        let line = raw.trim();
        if line.is_empty() {
            return Step::Continue;
        }

        debug!("VM {} - {}", self.request.vm_id, line);
        state.remember(line);
        state.record.append_log(line);

        for signal in parse_line(line) {
            self.apply_signal(state, signal);
        }

        self.persist(&mut state.record).await
    }

    fn apply_signal(&self, state: &mut RunState, signal: ParsedSignal) {
        let record = &mut state.record;
        match signal {
            ParsedSignal::StatusChanged(status) => {
                if record.status.can_advance_to(status) {
                    if record.status != status {
                        info!("VM {} status updated to: {}", record.id, status);
                    }
                    record.status = status;
                } else {
                    warn!(
                        "Ignoring backward status change for VM {}: {} -> {}",
                        record.id, record.status, status
                    );
                }
            }
            ParsedSignal::UnknownStatus(raw) => {
                warn!("VM {} reported unrecognized status '{}'", record.id, raw);
            }
            ParsedSignal::IpAddress(ip) => record.ip_address = Some(ip),
            ParsedSignal::SshInfo(info) => record.ssh_info = Some(info),
            ParsedSignal::VncInfo(info) => record.vnc_info = Some(info),
            ParsedSignal::Completed => {
                info!("VM {} reported creation complete", record.id);
                state.completion_observed = true;
            }
        }
    }

    /// Terminal status, the message for log and details, and whether the
    /// output tail belongs in the details.
    fn conclude(
        &self,
        state: &RunState,
        outcome: &ProcessOutcome,
        elapsed: Duration,
    ) -> (VmStatus, String, bool) {
        let noun = self.request.kind.noun();
        let secs = elapsed.as_secs_f64();

        match outcome {
            ProcessOutcome::Exited { code: 0 } => {
                let mut message =
                    format!("VM {} completed successfully in {:.2} seconds", noun, secs);
                if self.request.kind == OperationKind::Create && !state.completion_observed {
                    message.push_str(" (no completion marker reported)");
                }
                (SUCCESS_STATUS, message, false)
            }
            ProcessOutcome::Exited { code } => (
                VmStatus::Failed,
                format!(
                    "VM {} failed with exit code {} after {:.2} seconds",
                    noun, code, secs
                ),
                true,
            ),
            ProcessOutcome::Signaled => (
                VmStatus::Failed,
                format!(
                    "VM {} was terminated by a signal after {:.2} seconds",
                    noun, secs
                ),
                true,
            ),
            ProcessOutcome::TimedOut { after } => {
                let message = match self.request.kind {
                    OperationKind::Create => format!(
                        "VM creation exceeded expected duration of {}s (timeout); provisioning script was terminated",
                        after.as_secs()
                    ),
                    OperationKind::Activate => {
                        format!("VM activation timed out after {}s", after.as_secs())
                    }
                };
                (VmStatus::Failed, message, true)
            }
            ProcessOutcome::Killed => (
                VmStatus::Failed,
                format!("VM {} cancelled by operator after {:.2} seconds", noun, secs),
                false,
            ),
            ProcessOutcome::Faulted(reason) => (
                VmStatus::Error,
                format!("Unexpected error during VM {}: {}", noun, reason),
                true,
            ),
        }
    }

    async fn finish(
        &self,
        state: &mut RunState,
        status: VmStatus,
        message: String,
        tail: Option<String>,
    ) -> Option<VmStatus> {
        if status == SUCCESS_STATUS {
            info!("VM {} - {}", self.request.vm_id, message);
        } else {
            error!("VM {} - {}", self.request.vm_id, message);
        }

        let record = &mut state.record;
        record.status = status;
        record.append_log(message.clone());
        record.details = Some(match tail.filter(|t| !t.is_empty()) {
            Some(tail) => format!("{}\nOutput (last lines):\n{}", message, tail),
            None => message,
        });

        match self.persist(record).await {
            Step::Continue => Some(status),
            Step::Vanished => None,
        }
    }

    /// One write attempt. Backend errors are logged and the job carries on.
    async fn persist(&self, record: &mut VmRecord) -> Step {
        record.touch();
        match self.store.save_record(record).await {
            Ok(()) => Step::Continue,
            Err(StoreError::NotFound(_)) => {
                warn!(
                    "VM {} no longer exists during {}, stopping",
                    record.id,
                    self.request.kind.noun()
                );
                Step::Vanished
            }
            Err(e) => {
                error!("Error updating VM {}: {}", record.id, e);
                Step::Continue
            }
        }
    }
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Best-effort `Error` status for a job that died without finishing itself.
pub async fn record_fault(
    store: &dyn StateStore,
    vm_id: &str,
    kind: OperationKind,
    reason: &str,
) -> Option<VmStatus> {
    let mut record = match store.get_record(vm_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("VM {} vanished before its {} fault could be recorded", vm_id, kind.noun());
            return None;
        }
        Err(e) => {
            error!("Failed to load VM {} after fault '{}': {}", vm_id, reason, e);
            return None;
        }
    };

    let message = format!("Unexpected error during VM {}: {}", kind.noun(), reason);
    record.status = VmStatus::Error;
    record.append_log(message.clone());
    record.details = Some(message);
    record.touch();

    match store.save_record(&record).await {
        Ok(()) => Some(VmStatus::Error),
        Err(e) => {
            error!("Failed to update VM {} status after error: {}", vm_id, e);
            None
        }
    }
}
