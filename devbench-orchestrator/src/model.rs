use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OrchestratorConfig;

/// Lifecycle status of a devbench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum VmStatus {
    Creating,
    Activating,
    Running,
    Ready,
    Failed,
    Error,
}

impl VmStatus {
    pub const ALL: [VmStatus; 6] = [
        VmStatus::Creating,
        VmStatus::Activating,
        VmStatus::Running,
        VmStatus::Ready,
        VmStatus::Failed,
        VmStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Creating => "Creating",
            VmStatus::Activating => "Activating",
            VmStatus::Running => "Running",
            VmStatus::Ready => "Ready",
            VmStatus::Failed => "Failed",
            VmStatus::Error => "Error",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            VmStatus::Creating | VmStatus::Activating => 0,
            VmStatus::Running => 1,
            VmStatus::Ready | VmStatus::Failed | VmStatus::Error => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether an in-stream status report may move a VM from `self` to `next`.
    /// Status never moves backward within one job run.
    pub fn can_advance_to(&self, next: VmStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown VM status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for VmStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        VmStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownStatus(trimmed.to_string()))
    }
}

/// One timestamped line of a devbench's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.to_rfc3339(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub status: VmStatus,
    pub details: Option<String>,
    pub log: Vec<LogEntry>,
    pub ip_address: Option<String>,
    pub ssh_info: Option<String>,
    pub vnc_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    /// A fresh record in `Creating` state.
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            owner: owner.into(),
            status: VmStatus::Creating,
            details: None,
            log: Vec::new(),
            ip_address: None,
            ssh_info: None,
            vnc_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn append_log(&mut self, message: impl Into<String>) -> &LogEntry {
        self.log.push(LogEntry::now(message));
        &self.log[self.log.len() - 1]
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.log.iter().map(ToString::to_string).collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Activate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Activate => "activate",
        }
    }

    /// Status the caller sets before the job starts.
    pub fn initial_status(&self) -> VmStatus {
        match self {
            OperationKind::Create => VmStatus::Creating,
            OperationKind::Activate => VmStatus::Activating,
        }
    }

    pub fn noun(&self) -> &'static str {
        match self {
            OperationKind::Create => "creation",
            OperationKind::Activate => "activation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run the provisioning script against one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub vm_id: String,
    pub vm_name: String,
    pub username: String,
    pub kind: OperationKind,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ProvisionRequest {
    /// `provision_vm.sh create <user>_<vm>` with sanitized names.
    pub fn create(record: &VmRecord, config: &OrchestratorConfig) -> Self {
        Self {
            vm_id: record.id.clone(),
            vm_name: record.name.clone(),
            username: record.owner.clone(),
            kind: OperationKind::Create,
            args: vec![
                OperationKind::Create.as_str().to_string(),
                combined_name(&record.owner, &record.name),
            ],
            timeout: Some(config.create_timeout()),
        }
    }

    /// `provision_vm.sh activate <vm-name> <username>`.
    pub fn activate(record: &VmRecord, config: &OrchestratorConfig) -> Self {
        Self {
            vm_id: record.id.clone(),
            vm_name: record.name.clone(),
            username: record.owner.clone(),
            kind: OperationKind::Activate,
            args: vec![
                OperationKind::Activate.as_str().to_string(),
                record.name.clone(),
                record.owner.clone(),
            ],
            timeout: Some(config.activate_timeout()),
        }
    }
}

fn sanitize(input: &str, keep: impl Fn(char) -> bool) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || keep(c) { c } else { '_' })
        .collect()
}

/// Lower-cases and replaces anything but alphanumerics and `_` with `_`.
pub fn sanitize_username(username: &str) -> String {
    sanitize(username, |c| c == '_')
}

/// Like [`sanitize_username`] but also keeps `-`.
pub fn sanitize_vm_name(name: &str) -> String {
    sanitize(name, |c| c == '_' || c == '-')
}

/// The instance name handed to the script on create.
pub fn combined_name(username: &str, vm_name: &str) -> String {
    format!("{}_{}", sanitize_username(username), sanitize_vm_name(vm_name))
}
