pub mod env_spec;
pub mod error;
pub mod ipc;
pub mod logging;
mod pty;
pub mod sigtable;
pub mod status;
pub mod subject;
pub mod telemetry;
pub mod termios;

pub use env_spec::EnvSpec;
pub use error::{Result, SubjectError};
pub use ipc::{Endpoint, IpcMessage, Tag};
pub use sigtable::SigTable;
pub use status::StatusRecord;
pub use logging::log_debug;
pub use subject::{IdArg, Subject};
pub use telemetry::init_tracing;
pub use termios::Termios;
