use super::codec::{CommandReader, CommandWriter};
use super::command::Command;
use crate::error::{Error, Result};
use crate::process::{Controllable, ControlledProcess};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Decoded commands waiting for the consumer.
pub const QUEUE_CAPACITY: usize = 100;

/// Client connect timeout used by [`CommandStream::write`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on how long one connection may take to deliver its frame.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Accept loop: one connection, at most one command.
struct AcceptLoop {
    listener: UnixListener,
    queue: mpsc::Sender<Command>,
    connection_timeout: Duration,
}

impl AcceptLoop {
    async fn read_one(&self, conn: &mut UnixStream) -> Option<Command> {
        let mut reader = CommandReader::new();
        let read = async {
            while !reader.is_closed() {
                if let Some(cmd) = reader.read(&mut *conn).await {
                    return Some(cmd);
                }
            }
            None
        };

        match tokio::time::timeout(self.connection_timeout, read).await {
            Ok(cmd) => cmd,
            Err(_) => {
                warn!(
                    "Control connection sent no complete command within {:?}",
                    self.connection_timeout
                );
                None
            }
        }
    }
}

impl Controllable for AcceptLoop {
    fn name(&self) -> &str {
        "command-stream"
    }

    async fn main(&self, ctx: ControlledProcess) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = ctx.stopped() => break,
                accepted = self.listener.accept() => accepted,
            };

            let mut conn = match accepted {
                Ok((conn, _)) => conn,
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => {
                    warn!("Control connection reset before accept: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Accept error on control socket: {}", e);
                    continue;
                }
            };
            trace!("Control connection accepted");

            let decoded = tokio::select! {
                _ = ctx.stopped() => break,
                decoded = self.read_one(&mut conn) => decoded,
            };
            drop(conn);

            let Some(cmd) = decoded else {
                continue;
            };
            debug!("Decoded control command {}", cmd);

            tokio::select! {
                _ = ctx.stopped() => break,
                sent = self.queue.send(cmd) => {
                    if sent.is_err() {
                        warn!("Command queue consumer is gone, stopping accept loop");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

struct OpenStream {
    acceptor: ControlledProcess,
    queue: mpsc::Receiver<Command>,
}

/// Local control channel bound to a UNIX socket path.
///
/// The server side ([`open`](Self::open), [`read`](Self::read),
/// [`close`](Self::close)) feeds decoded commands through a bounded queue.
/// The client side ([`write`](Self::write)) works whether or not this
/// instance is open.
pub struct CommandStream {
    path: PathBuf,
    connect_timeout: Duration,
    connection_timeout: Duration,
    open: Option<OpenStream>,
}

impl CommandStream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            open: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Bind the socket (replacing any stale one) and start the accept loop.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        remove_socket(&self.path)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&self.path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let acceptor = ControlledProcess::new(Arc::new(AcceptLoop {
            listener,
            queue: tx,
            connection_timeout: self.connection_timeout,
        }));
        acceptor.start();

        info!("Control socket listening on {}", self.path.display());
        self.open = Some(OpenStream {
            acceptor,
            queue: rx,
        });
        Ok(())
    }

    /// Stop the accept loop, remove the socket and discard queued commands.
    pub async fn close(&mut self) {
        let Some(mut open) = self.open.take() else {
            return;
        };

        open.acceptor.stop(CLOSE_TIMEOUT).await;
        if let Err(e) = remove_socket(&self.path) {
            warn!("Failed to remove control socket {}: {}", self.path.display(), e);
        }

        open.queue.close();
        let mut discarded = 0usize;
        while open.queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} queued commands on close", discarded);
        }
        info!("Control socket closed");
    }

    /// Next decoded command, or `None` if nothing arrives within `timeout`.
    pub async fn read(&mut self, timeout: Duration) -> Option<Command> {
        let open = self.open.as_mut()?;
        match tokio::time::timeout(timeout, open.queue.recv()).await {
            Ok(cmd) => cmd,
            Err(_) => None,
        }
    }

    /// Send `cmd` to whichever listener owns the socket path.
    ///
    /// Opens a fresh connection per call.
    pub async fn write(&self, cmd: &Command) -> Result<()> {
        let connect = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.path));
        let mut conn = match connect.await {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                return Err(Error::Connect {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(Error::Connect {
                    path: self.path.clone(),
                    source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        CommandWriter::write(cmd, &mut conn).await?;
        debug!("Sent {} to {}", cmd, self.path.display());
        Ok(())
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if let Some(open) = self.open.take() {
            open.acceptor.abort();
            let _ = remove_socket(&self.path);
        }
    }
}

fn remove_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            trace!("Removed socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
