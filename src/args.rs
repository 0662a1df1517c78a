use appvisor::CommandStream;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "appvisor")]
#[command(version)]
#[command(about = "Supervise an application and control it over a local socket", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run an application under supervision
    Run {
        #[command(flatten)]
        socket: SocketArgs,

        /// Pidfile the application writes its PID to. Can also be set via APPVISOR_PIDFILE.
        #[arg(long)]
        pidfile: Option<PathBuf>,

        /// How long each command poll waits, in milliseconds
        #[arg(long)]
        poll_timeout_ms: Option<u64>,

        /// Seconds the application gets to stop before it is terminated
        #[arg(long)]
        stop_timeout_secs: Option<u64>,

        /// Program to run, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Ask a running supervisor to stop its application
    Stop {
        #[command(flatten)]
        socket: SocketArgs,
    },

    /// Ask a running supervisor to restart its application
    Restart {
        #[command(flatten)]
        socket: SocketArgs,
    },
}

#[derive(Args)]
pub(crate) struct SocketArgs {
    /// Control socket path. Can also be set via APPVISOR_SOCKET.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Connect timeout in milliseconds. Can also be set via APPVISOR_CONNECT_TIMEOUT_MS.
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,
}

impl SocketArgs {
    pub fn resolve(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(appvisor::clienv::socket_path)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(appvisor::clienv::connect_timeout)
    }

    /// Client handle for the resolved socket.
    pub fn client(&self) -> CommandStream {
        CommandStream::new(self.resolve()).with_connect_timeout(self.connect_timeout())
    }
}
