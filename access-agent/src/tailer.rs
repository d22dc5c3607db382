use crate::monitor::EventSender;
use crate::parsers::strip_line_terminator;
use crate::record::{LifecycleEvent, RawLine};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(500);
const READ_BUFFER_BYTES: usize = 64 * 1024;

pub(crate) async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Polling tail over a single append-only file.
pub struct LineSource {
    path: PathBuf,
    reader: BufReader<File>,
    start_offset: u64,
}

impl LineSource {
    /// Opens `path` positioned at its current end, so only lines appended from now on are read.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let start_offset = file
            .seek(SeekFrom::End(0))
            .await
            .with_context(|| format!("failed to seek {} to end", path.display()))?;

        info!(path = %path.display(), offset = start_offset, "opened source file at end");

        Ok(Self {
            path,
            reader: BufReader::with_capacity(READ_BUFFER_BYTES, file),
            start_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Reads complete lines forever, handing each one to `lines`.
    ///
    /// Every line emits one `LineHandled` event before it is queued. A full queue blocks the
    /// tail. Any read error other than end of file ends the loop with that error.
    pub async fn run(
        mut self,
        lines: flume::Sender<RawLine>,
        events: EventSender,
        poll_interval: Duration,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let sleep_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };
        let mut pending: Vec<u8> = Vec::new();
        let mut lines_read: u64 = 0;

        info!(path = %self.path.display(), "starting tailer");

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            let bytes_read = self
                .reader
                .read_until(b'\n', &mut pending)
                .await
                .with_context(|| format!("failed to read from {}", self.path.display()))?;

            // End of file, possibly in the middle of a line still being written. The partial
            // bytes stay in `pending` and are completed by the next read.
            if bytes_read == 0 || pending.last() != Some(&b'\n') {
                if sleep_or_cancel(sleep_interval, &cancel_token).await {
                    break;
                }
                continue;
            }

            let mut line = std::mem::take(&mut pending);
            strip_line_terminator(&mut line);
            lines_read += 1;
            events.emit(LifecycleEvent::LineHandled);

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                sent = lines.send_async(line) => {
                    if sent.is_err() {
                        bail!("line queue closed while tailing {}", self.path.display());
                    }
                }
            }
        }

        debug!(
            path = %self.path.display(),
            lines_read,
            buffered_bytes = pending.len(),
            "tailer stopped"
        );
        Ok(())
    }
}
