use crate::args::SocketArgs;
use appvisor::runner::forward_signals;
use appvisor::{ApplicationRunner, SupervisorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub(crate) async fn cmd_run(
    socket: SocketArgs,
    pidfile: Option<PathBuf>,
    poll_timeout_ms: Option<u64>,
    stop_timeout_secs: Option<u64>,
    command: Vec<String>,
) -> anyhow::Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("No program given to supervise"))?;

    let mut config = SupervisorConfig::new(program.clone())
        .args(args.iter().cloned())
        .socket_path(socket.resolve())
        .connect_timeout(socket.connect_timeout());
    if let Some(pidfile) = pidfile {
        config = config.pidfile_path(pidfile);
    }
    if let Some(ms) = poll_timeout_ms {
        config = config.poll_timeout(Duration::from_millis(ms));
    }
    if let Some(secs) = stop_timeout_secs {
        config = config.stop_timeout(Duration::from_secs(secs));
    }

    tracing::debug!(
        socket = %config.socket_path.display(),
        pidfile = %config.pidfile_path.display(),
        "Resolved supervisor configuration"
    );

    let runner = Arc::new(ApplicationRunner::new(config));
    forward_signals(Arc::clone(&runner))?;

    let code = runner.run().await?;
    Ok(code.unwrap_or(0))
}
