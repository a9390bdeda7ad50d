//! Forward-only line streams from a running target.
//!
//! A [`StreamSource`] is fed raw bytes by one background reader task (a
//! serial device, a tailed log file, or a child process pipe) and hands out
//! completed lines to exactly one owner. Consumed lines are never delivered
//! again; they are kept in [`StreamSource::history`] for re-scanning.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, Result};

/// How often a tailed file is re-read once its end has been reached.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 4096;

/// Result of a single bounded-wait line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    Line(String),
    /// No complete line arrived before the deadline. Not an error.
    WouldBlock,
    /// The producer is gone and every buffered line has been delivered.
    Eof,
}

enum Feed {
    Data(Vec<u8>),
    Failed(io::Error),
}

/// Producer half of a [`StreamSource`]. Cheap to clone; the stream reaches
/// EOF once every feeder has been dropped.
#[derive(Clone)]
pub struct Feeder {
    tx: mpsc::UnboundedSender<Feed>,
}

impl Feeder {
    /// Appends raw bytes. Returns `false` if the stream has been closed.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.tx.send(Feed::Data(bytes.into())).is_ok()
    }

    /// Reports a device failure; the consumer sees it as [`Error::Io`].
    pub fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Feed::Failed(err));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct StreamSource {
    name: String,
    rx: mpsc::UnboundedReceiver<Feed>,
    partial: Vec<u8>,
    ready: VecDeque<String>,
    history: String,
    eof: bool,
    readers: Vec<JoinHandle<()>>,
}

impl StreamSource {
    /// Creates a stream fed by hand through the returned [`Feeder`].
    pub fn channel(name: impl Into<String>) -> (Feeder, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            name: name.into(),
            rx,
            partial: Vec::new(),
            ready: VecDeque::new(),
            history: String::new(),
            eof: false,
            readers: Vec::new(),
        };
        (Feeder { tx }, source)
    }

    /// Streams everything read from `reader` until it reports EOF.
    pub fn from_reader<R>(name: impl Into<String>, mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (feeder, mut source) = Self::channel(name);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if !feeder.send(&buf[..n]) {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        feeder.fail(err);
                        break;
                    }
                }
            }
        });
        source.readers.push(task);
        source
    }

    /// Opens a character device (a serial console) or any readable path and
    /// streams it until EOF.
    pub async fn open_device(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|err| Error::io(path.display().to_string(), err))?;
        Ok(Self::from_reader(path.display().to_string(), file))
    }

    /// Follows a log file that may not exist yet, like `tail -F`. The stream
    /// never reaches EOF on its own; it ends when closed or dropped.
    pub fn tail_file(path: impl Into<PathBuf>, poll: Duration) -> Self {
        let path = path.into();
        let (feeder, mut source) = Self::channel(path.display().to_string());
        let task = tokio::spawn(async move {
            let mut file = loop {
                match tokio::fs::File::open(&path).await {
                    Ok(file) => break file,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        if feeder.is_closed() {
                            return;
                        }
                        tokio::time::sleep(poll).await;
                    }
                    Err(err) => {
                        feeder.fail(err);
                        return;
                    }
                }
            };
            tracing::debug!(path = %path.display(), "tailing log file");

            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => {
                        if feeder.is_closed() {
                            return;
                        }
                        tokio::time::sleep(poll).await;
                    }
                    Ok(n) => {
                        if !feeder.send(&buf[..n]) {
                            return;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        feeder.fail(err);
                        return;
                    }
                }
            }
        });
        source.readers.push(task);
        source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every line consumed so far, each terminated by `\n`.
    pub fn history(&self) -> &str {
        &self.history
    }

    /// The retained fragment of a line whose newline has not arrived yet.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.partial).into_owned()
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.ready.is_empty()
    }

    /// Reads the next completed line, waiting no later than `deadline`
    /// (`None` waits indefinitely).
    ///
    /// Cancelling the returned future keeps any partial fragment for the
    /// next call.
    pub async fn read_line(&mut self, deadline: Option<Instant>) -> Result<ReadLine> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                self.history.push_str(&line);
                self.history.push('\n');
                return Ok(ReadLine::Line(line));
            }
            if self.eof {
                return Ok(ReadLine::Eof);
            }

            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, self.rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => return Ok(ReadLine::WouldBlock),
                },
                None => self.rx.recv().await,
            };

            match next {
                Some(Feed::Data(bytes)) => self.ingest(&bytes),
                Some(Feed::Failed(err)) => {
                    self.eof = true;
                    return Err(Error::io(self.name.clone(), err));
                }
                None => {
                    self.eof = true;
                    if !self.partial.is_empty() {
                        let tail = std::mem::take(&mut self.partial);
                        self.push_line(&tail);
                    }
                }
            }
        }
    }

    /// Stops the background reader and discards anything not yet read.
    pub fn close(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.rx.close();
        self.eof = true;
        self.ready.clear();
        self.partial.clear();
    }

    pub(crate) fn attach_reader(&mut self, reader: JoinHandle<()>) {
        self.readers.push(reader);
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            let line = std::mem::take(&mut self.partial);
            self.push_line(&line);
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    fn push_line(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        self.ready.push_back(String::from_utf8_lossy(raw).into_owned());
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("name", &self.name)
            .field("buffered_lines", &self.ready.len())
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soon() -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(50))
    }

    #[tokio::test]
    async fn split_fragments_are_rejoined() {
        let (feeder, mut source) = StreamSource::channel("test");
        feeder.send("test1 P");
        assert_eq!(source.read_line(soon()).await.unwrap(), ReadLine::WouldBlock);
        assert_eq!(source.pending(), "test1 P");

        feeder.send("ASS\r\nnext");
        assert_eq!(
            source.read_line(soon()).await.unwrap(),
            ReadLine::Line("test1 PASS".into())
        );
        assert_eq!(source.read_line(soon()).await.unwrap(), ReadLine::WouldBlock);
        assert_eq!(source.history(), "test1 PASS\n");
    }

    #[tokio::test]
    async fn unterminated_tail_is_delivered_at_eof() {
        let (feeder, mut source) = StreamSource::channel("test");
        feeder.send("a\nb");
        drop(feeder);
        assert_eq!(source.read_line(None).await.unwrap(), ReadLine::Line("a".into()));
        assert_eq!(source.read_line(None).await.unwrap(), ReadLine::Line("b".into()));
        assert_eq!(source.read_line(None).await.unwrap(), ReadLine::Eof);
        assert!(source.is_eof());
    }

    #[tokio::test]
    async fn device_failure_surfaces_as_io_error() {
        let (feeder, mut source) = StreamSource::channel("/dev/ttyUSB0");
        feeder.fail(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        let err = source.read_line(soon()).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn reader_streams_until_eof() {
        let data: &[u8] = b"boot ok\nready\n";
        let mut source = StreamSource::from_reader("mem", data);
        assert_eq!(
            source.read_line(None).await.unwrap(),
            ReadLine::Line("boot ok".into())
        );
        assert_eq!(
            source.read_line(None).await.unwrap(),
            ReadLine::Line("ready".into())
        );
        assert_eq!(source.read_line(None).await.unwrap(), ReadLine::Eof);
    }

    #[tokio::test]
    async fn close_stops_delivery() {
        let (feeder, mut source) = StreamSource::channel("test");
        feeder.send("x\n");
        source.close();
        assert!(!feeder.send("y\n"));
        assert_eq!(source.read_line(soon()).await.unwrap(), ReadLine::Eof);
    }
}
