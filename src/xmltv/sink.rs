//! Output sinks for the XMLTV document
//!
//! The writer only needs an ordered, append-capable byte sink. This module
//! provides the supported destinations: a file, a unix domain socket,
//! standard output, and an in-memory buffer used by tests and embedders.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, BufWriter};
use tracing::debug;

use crate::config::Settings;
use crate::errors::{AppError, AppResult};

/// A boxed async byte sink with a human readable description for logs.
pub struct OutputSink {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    description: String,
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("description", &self.description)
            .finish()
    }
}

impl OutputSink {
    /// Wrap any async writer
    pub fn from_writer<W, S>(writer: W, description: S) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        S: Into<String>,
    {
        Self {
            inner: Box::new(writer),
            description: description.into(),
        }
    }

    /// Create (truncate) a file
    pub async fn file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::from_writer(
            BufWriter::new(file),
            format!("file {}", path.display()),
        ))
    }

    /// Connect to a listening unix domain socket
    #[cfg(unix)]
    pub async fn unix_socket<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::from_writer(
            BufWriter::new(stream),
            format!("socket {}", path.display()),
        ))
    }

    pub fn stdout() -> Self {
        Self::from_writer(BufWriter::new(tokio::io::stdout()), "stdout")
    }

    /// In-memory sink plus a handle to read back what was written
    pub fn memory() -> (Self, MemoryBuffer) {
        let buffer = MemoryBuffer::default();
        let sink = Self::from_writer(
            MemoryWriter {
                buffer: buffer.clone(),
            },
            "memory",
        );
        (sink, buffer)
    }

    /// Open the destination selected by settings: file, socket or stdout.
    pub async fn from_settings(settings: &Settings) -> AppResult<Self> {
        let sink = if let Some(path) = &settings.xml_file {
            Self::file(path).await.map_err(AppError::Sink)?
        } else if let Some(path) = &settings.xml_sock {
            Self::open_socket(path).await?
        } else {
            Self::stdout()
        };
        debug!("Writing XMLTV document to {}", sink.description());
        Ok(sink)
    }

    #[cfg(unix)]
    async fn open_socket(path: &Path) -> AppResult<Self> {
        Self::unix_socket(path).await.map_err(AppError::Sink)
    }

    #[cfg(not(unix))]
    async fn open_socket(path: &Path) -> AppResult<Self> {
        Err(AppError::configuration(format!(
            "Domain socket output is not supported on this platform: {}",
            path.display()
        )))
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        self.inner.as_mut()
    }
}

/// Shared handle over the bytes written to a [`OutputSink::memory`] sink
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

struct MemoryWriter {
    buffer: MemoryBuffer,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut bytes = self
            .buffer
            .bytes
            .lock()
            .map_err(|_| io::Error::other("memory sink poisoned"))?;
        bytes.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
