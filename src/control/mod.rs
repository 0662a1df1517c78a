//! Local control channel.
//!
//! Clients connect to a UNIX socket, send one `0x00`-terminated JSON frame
//! and disconnect. The listening side decodes frames on its own task and
//! queues them for the supervisor.
//!
//! ```text
//! client ──write──▶ socket ──▶ accept loop ──▶ CommandReader ──▶ queue ──▶ runner
//! ```

pub mod codec;
pub mod command;
pub mod stream;

pub use codec::{CommandReader, CommandWriter, MAX_BUFSIZE, READ_CHUNK_SIZE};
pub use command::{ArgsError, Command, CommandTarget, COMMAND_TYPE, END_OF_COMMAND};
pub use stream::{CommandStream, QUEUE_CAPACITY};
