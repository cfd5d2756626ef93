//! Devbench provisioning orchestration
//!
//! Runs the external provisioning script for a devbench, turns its output
//! into status, connection details and a timestamped log, and keeps all of
//! that in a [`StateStore`]. Consumed by the `devbench` CLI but usable from
//! any other entry point that owns a Tokio runtime.

pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod log_parser;
pub mod model;
pub mod scheduler;
pub mod service;
pub mod sqlite;
pub mod store;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use job::{JobReport, VmJob};
pub use log_parser::{parse_line, ParsedSignal};
pub use model::{LogEntry, OperationKind, ProvisionRequest, VmRecord, VmStatus};
pub use scheduler::{JobReservation, JobScheduler, JobTicket, LiveJob};
pub use service::DevbenchService;
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, StateStore, StoreError};
