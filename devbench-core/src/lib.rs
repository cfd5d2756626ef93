pub mod command_stream;
pub mod error;

pub use command_stream::{spawn_streaming, CommandSpec, ProcessOutcome, StreamingCommand};
pub use error::{Result, VmError};
