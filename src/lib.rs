#[cfg(not(unix))]
compile_error!("appvisor needs UNIX domain sockets and POSIX signals");

pub mod clienv;
pub mod control;
pub mod error;
pub mod events;
pub mod process;
pub mod runner;

pub use control::{Command, CommandStream};
pub use error::{Error, Result};
pub use events::{EventSink, SupervisorEvent, TracingSink};
pub use process::{ApplicationProcess, Controllable, ControlledProcess, LifecycleState};
pub use runner::{ApplicationRunner, SupervisorConfig};
