//! Relays transport output into the log.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which transport output stream is being relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Logged at INFO.
    Stdout,
    /// Logged at ERROR.
    Stderr,
}

impl OutputStream {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn emit(self, line: &str) {
        match self {
            Self::Stdout => info!(stream = self.as_str(), "{line}"),
            Self::Stderr => error!(stream = self.as_str(), "{line}"),
        }
    }
}

/// Read `reader` line by line, handing each line to `on_line`, until
/// end-of-stream or `cancel` fires. Returns the number of lines delivered.
///
/// Lines are decoded lossily, so a stray non-UTF-8 byte never ends the relay.
/// A trailing `\n` or `\r\n` is stripped.
pub async fn drain_lines<R, F>(reader: R, cancel: &CancellationToken, mut on_line: F) -> usize
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    on_line(&String::from_utf8_lossy(&buf));
                    count += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read transport output");
                    break;
                }
            },
        }
    }
    count
}

/// Relay one output stream into the log at the stream's severity.
pub async fn relay<R>(reader: R, stream: OutputStream, cancel: CancellationToken) -> usize
where
    R: AsyncRead + Unpin,
{
    let count = drain_lines(reader, &cancel, |line| stream.emit(line)).await;
    debug!(stream = stream.as_str(), lines = count, "Output relay finished");
    count
}
