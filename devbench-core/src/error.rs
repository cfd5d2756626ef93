use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    /// The executable could not be located or started. No output was produced.
    Spawn { program: String, reason: String },
    Io(#[from] std::io::Error),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            VmError::Spawn { program, reason } => {
                write!(f, "Failed to start '{}': {}", program, reason)
            }
            VmError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl VmError {
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, VmError::Spawn { .. })
    }
}

pub type Result<T> = std::result::Result<T, VmError>;
