mod args;
mod commands;
mod init;

use appvisor::Command;
use args::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init::initialize_tracing();

    match cli.command {
        Commands::Run {
            socket,
            pidfile,
            poll_timeout_ms,
            stop_timeout_secs,
            command,
        } => {
            let code =
                commands::run::cmd_run(socket, pidfile, poll_timeout_ms, stop_timeout_secs, command)
                    .await?;
            std::process::exit(code);
        }
        Commands::Stop { socket } => commands::control::cmd_send(socket, Command::Stop).await?,
        Commands::Restart { socket } => {
            commands::control::cmd_send(socket, Command::Restart).await?
        }
    }

    Ok(())
}
