use crate::args::SocketArgs;
use appvisor::Command;

pub(crate) async fn cmd_send(socket: SocketArgs, command: Command) -> anyhow::Result<()> {
    let client = socket.client();
    client.write(&command).await?;
    tracing::info!("Sent {} to {}", command, client.path().display());
    Ok(())
}
