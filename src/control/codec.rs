use super::command::{Command, END_OF_COMMAND};
use crate::error::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

/// Bytes requested from the connection per [`CommandReader::read`] call.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Largest frame body the reader will buffer before giving up on it.
pub const MAX_BUFSIZE: usize = 8192;

/// Incremental decoder for `0x00`-terminated command frames.
///
/// Chunk boundaries are unrelated to frame boundaries: a frame may arrive
/// split over several reads, and one read may carry the tail of a frame plus
/// the start of the next. Bytes following a terminator are kept for the next
/// call.
pub struct CommandReader {
    buf: Vec<u8>,
    pending: Vec<u8>,
    max_bufsize: usize,
    chunk_size: usize,
    closed: bool,
}

impl CommandReader {
    pub fn new() -> Self {
        Self::with_limits(MAX_BUFSIZE, READ_CHUNK_SIZE)
    }

    pub fn with_limits(max_bufsize: usize, chunk_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            pending: Vec::new(),
            max_bufsize,
            chunk_size: chunk_size.max(1),
            closed: false,
        }
    }

    /// True once the connection hit EOF or failed. No further bytes will be read.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of bytes buffered for the frame currently being assembled.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read at most one chunk from `conn` and return a command if a frame completed.
    ///
    /// Never fails: I/O errors and malformed frames are logged and reported as
    /// "no command yet".
    pub async fn read<R>(&mut self, conn: &mut R) -> Option<Command>
    where
        R: AsyncRead + Unpin,
    {
        if !self.pending.is_empty() {
            let carried = std::mem::take(&mut self.pending);
            if let Some(cmd) = self.feed(&carried) {
                return Some(cmd);
            }
            if !self.pending.is_empty() {
                // A malformed frame was dropped; the rest waits for the next call.
                return None;
            }
        }

        if self.closed {
            return None;
        }

        let mut chunk = vec![0u8; self.chunk_size];
        match conn.read(&mut chunk).await {
            Ok(0) => {
                trace!("Control connection reached EOF");
                self.closed = true;
                None
            }
            Ok(n) => {
                trace!("Read {} bytes from control connection", n);
                self.feed(&chunk[..n])
            }
            Err(e) => {
                warn!("Failed to read from control connection: {}", e);
                self.closed = true;
                None
            }
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Option<Command> {
        for (i, &byte) in bytes.iter().enumerate() {
            if byte == END_OF_COMMAND {
                let frame = std::mem::take(&mut self.buf);
                self.pending.extend_from_slice(&bytes[i + 1..]);
                return match Command::parse(&frame) {
                    Ok(cmd) => Some(cmd),
                    Err(e) => {
                        warn!("Dropping malformed command frame: {}", e);
                        None
                    }
                };
            }

            self.buf.push(byte);
            if self.buf.len() > self.max_bufsize {
                warn!(
                    "Command frame exceeded {} bytes without a terminator, discarding",
                    self.max_bufsize
                );
                self.buf.clear();
            }
        }
        None
    }
}

impl Default for CommandReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder side of the control channel.
pub struct CommandWriter;

impl CommandWriter {
    /// Write one complete frame to `conn`.
    pub async fn write<W>(cmd: &Command, conn: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = cmd.serialize();
        conn.write_all(&bytes).await?;
        conn.flush().await?;
        trace!("Wrote {} ({} bytes)", cmd, bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    #[tokio::test]
    async fn test_reads_single_frame() {
        let frame = Command::Stop.serialize();
        let mut reader = CommandReader::new();
        let cmd = reader.read(&mut frame.as_slice()).await;
        assert_eq!(cmd, Some(Command::Stop));
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let frame = Command::Restart.serialize();
        let (head, tail) = frame.split_at(10);
        let mut reader = CommandReader::new();

        assert_eq!(reader.read(&mut &head[..]).await, None);
        assert_eq!(reader.buffered(), 10);
        assert_eq!(reader.read(&mut &tail[..]).await, Some(Command::Restart));
    }

    #[tokio::test]
    async fn test_back_to_back_frames_in_one_chunk() {
        let mut bytes = Command::Stop.serialize();
        bytes.extend(Command::Restart.serialize());
        let mut conn = bytes.as_slice();
        let mut reader = CommandReader::new();

        assert_eq!(reader.read(&mut conn).await, Some(Command::Stop));
        assert_eq!(reader.read(&mut conn).await, Some(Command::Restart));
        assert_eq!(reader.read(&mut conn).await, None);
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_no_terminator_never_yields() {
        let noise = vec![b'x'; MAX_BUFSIZE];
        let mut conn = noise.as_slice();
        let mut reader = CommandReader::new();

        while !reader.is_closed() {
            assert_eq!(reader.read(&mut conn).await, None);
        }
    }

    #[tokio::test]
    async fn test_overflow_resets_and_recovers() {
        let mut bytes = vec![b'{'; MAX_BUFSIZE + 1];
        bytes.extend(Command::Stop.serialize());
        let mut conn = bytes.as_slice();
        let mut reader = CommandReader::new();

        let mut decoded = None;
        while decoded.is_none() && !reader.is_closed() {
            decoded = reader.read(&mut conn).await;
            assert!(reader.buffered() <= MAX_BUFSIZE);
        }
        assert_eq!(decoded, Some(Command::Stop));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut bytes = b"{\"type\":\"command\",\"command\":\"Nope\"}\0".to_vec();
        bytes.extend(Command::Restart.serialize());
        let mut conn = bytes.as_slice();
        let mut reader = CommandReader::new();

        assert_eq!(reader.read(&mut conn).await, None);
        assert_eq!(reader.read(&mut conn).await, Some(Command::Restart));
    }

    #[tokio::test]
    async fn test_io_error_is_swallowed() {
        let mut reader = CommandReader::new();
        assert_eq!(reader.read(&mut ResetReader).await, None);
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_writer_emits_full_frame() {
        let mut out = Vec::new();
        CommandWriter::write(&Command::Restart, &mut out).await.unwrap();
        assert_eq!(out, Command::Restart.serialize());
    }
}
