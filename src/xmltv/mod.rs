//! Ordered XMLTV stream writer
//!
//! A single [`XmltvWriter`] is shared (behind an `Arc`) by every producer of
//! the document. It enforces the document structure:
//!
//! - the prologue (`<?xml ...?>`, doctype, `<tv>`) is written once, first;
//! - channel headers are only accepted before the first program body;
//! - each fragment is written with one `write_all` under an async mutex, so
//!   two providers' output never interleaves;
//! - `</tv>` is written once by [`XmltvWriter::close`], which
//!   [`with_document`] runs on every exit path.

pub mod render;
pub mod sink;

use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
pub use render::RenderOptions;
pub use sink::{MemoryBuffer, OutputSink};

/// Kind of fragment being appended, used to enforce headers-then-bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    ChannelHeaders,
    Programs,
}

/// Counters reported once the document is closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub bytes_written: u64,
    pub header_fragments: usize,
    pub program_fragments: usize,
}

struct WriterState {
    sink: OutputSink,
    prologue_written: bool,
    bodies_started: bool,
    closed: bool,
    stats: WriterStats,
}

pub struct XmltvWriter {
    generator: String,
    state: Mutex<WriterState>,
}

impl XmltvWriter {
    pub fn new<S: Into<String>>(sink: OutputSink, generator: S) -> Self {
        Self {
            generator: generator.into(),
            state: Mutex::new(WriterState {
                sink,
                prologue_written: false,
                bodies_started: false,
                closed: false,
                stats: WriterStats::default(),
            }),
        }
    }

    /// Default generator string, e.g. `epg2xml v0.1.0`
    pub fn default_generator() -> String {
        format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    /// Emit the XML declaration, doctype and `<tv>` open tag.
    pub async fn write_prologue(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(AppError::internal("XMLTV document already closed"));
        }
        if state.prologue_written {
            return Err(AppError::internal("XMLTV prologue already written"));
        }
        Self::write_prologue_locked(&mut state, &self.generator).await
    }

    async fn write_prologue_locked(state: &mut WriterState, generator: &str) -> AppResult<()> {
        let prologue = render::render_prologue(generator);
        Self::write_locked(state, prologue.as_bytes()).await?;
        state.prologue_written = true;
        debug!("Wrote XMLTV prologue to {}", state.sink.description());
        Ok(())
    }

    /// Append one complete fragment.
    ///
    /// Channel headers are rejected once any program body has been written.
    pub async fn write_fragment(&self, kind: FragmentKind, fragment: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(AppError::internal("XMLTV document already closed"));
        }
        if !state.prologue_written {
            return Err(AppError::internal(
                "XMLTV prologue must be written before any element",
            ));
        }
        match kind {
            FragmentKind::ChannelHeaders if state.bodies_started => {
                return Err(AppError::internal(
                    "Channel headers must precede all program bodies",
                ));
            }
            FragmentKind::ChannelHeaders => state.stats.header_fragments += 1,
            FragmentKind::Programs => {
                state.bodies_started = true;
                state.stats.program_fragments += 1;
            }
        }
        if fragment.is_empty() {
            return Ok(());
        }
        Self::write_locked(&mut state, fragment.as_bytes()).await
    }

    async fn write_locked(state: &mut WriterState, bytes: &[u8]) -> AppResult<()> {
        state
            .sink
            .writer()
            .write_all(bytes)
            .await
            .map_err(AppError::Sink)?;
        state.stats.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Emit `</tv>`, flush and shut the sink down. Idempotent.
    ///
    /// If the prologue was never written it is written first, so a closed
    /// document is always well-formed even when the run failed early.
    pub async fn close(&self) -> AppResult<WriterStats> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(state.stats);
        }
        state.closed = true;

        if !state.prologue_written {
            Self::write_prologue_locked(&mut state, &self.generator).await?;
        }
        Self::write_locked(&mut state, render::render_epilogue().as_bytes()).await?;

        let writer = state.sink.writer();
        writer.flush().await.map_err(AppError::Sink)?;
        writer.shutdown().await.map_err(AppError::Sink)?;

        debug!(
            "Closed XMLTV document on {}: {} bytes",
            state.sink.description(),
            state.stats.bytes_written
        );
        Ok(state.stats)
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn stats(&self) -> WriterStats {
        self.state.lock().await.stats
    }
}

/// Run `body` against the writer and close the document afterwards,
/// whatever the body returned.
///
/// The body's error wins over a close error; a close error on an otherwise
/// successful run is returned as is.
pub async fn with_document<F, Fut, T>(writer: Arc<XmltvWriter>, body: F) -> AppResult<T>
where
    F: FnOnce(Arc<XmltvWriter>) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let result = body(writer.clone()).await;
    let closed = writer.close().await;

    match (result, closed) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(body_err), Ok(_)) => Err(body_err),
        (Err(body_err), Err(close_err)) => {
            warn!("Failed to close XMLTV document: {}", close_err);
            Err(body_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncWrite;

    fn memory_writer() -> (Arc<XmltvWriter>, MemoryBuffer) {
        let (sink, buffer) = OutputSink::memory();
        (Arc::new(XmltvWriter::new(sink, "test")), buffer)
    }

    /// Sink that accepts `budget` bytes then fails every write
    struct FailingSink {
        budget: usize,
    }

    impl AsyncWrite for FailingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.budget < buf.len() {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::StorageFull, "disk full")));
            }
            self.budget -= buf.len();
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_document_structure() {
        let (writer, buffer) = memory_writer();
        writer.write_prologue().await.unwrap();
        writer
            .write_fragment(FragmentKind::ChannelHeaders, "  <channel id=\"a\"/>\n")
            .await
            .unwrap();
        writer
            .write_fragment(FragmentKind::Programs, "  <programme channel=\"a\"/>\n")
            .await
            .unwrap();
        let stats = writer.close().await.unwrap();

        let doc = buffer.to_string_lossy();
        assert!(doc.starts_with("<?xml"));
        assert!(doc.ends_with("</tv>\n"));
        assert!(doc.find("<channel").unwrap() < doc.find("<programme").unwrap());
        assert_eq!(stats.header_fragments, 1);
        assert_eq!(stats.program_fragments, 1);
        assert_eq!(stats.bytes_written, doc.len() as u64);
    }

    #[tokio::test]
    async fn test_writes_reach_sink_in_order() {
        let prologue = render::render_prologue("test");
        let mock = tokio_test::io::Builder::new()
            .write(prologue.as_bytes())
            .write(b"  <channel id=\"a\"/>\n")
            .write(b"</tv>\n")
            .build();
        let writer = XmltvWriter::new(OutputSink::from_writer(mock, "mock"), "test");

        writer.write_prologue().await.unwrap();
        writer
            .write_fragment(FragmentKind::ChannelHeaders, "  <channel id=\"a\"/>\n")
            .await
            .unwrap();
        // empty fragments never reach the sink
        writer.write_fragment(FragmentKind::Programs, "").await.unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_prologue_only_once() {
        let (writer, _) = memory_writer();
        writer.write_prologue().await.unwrap();
        assert!(writer.write_prologue().await.is_err());
    }

    #[tokio::test]
    async fn test_headers_rejected_after_bodies() {
        let (writer, buffer) = memory_writer();
        writer.write_prologue().await.unwrap();
        writer
            .write_fragment(FragmentKind::Programs, "<programme/>")
            .await
            .unwrap();
        let err = writer
            .write_fragment(FragmentKind::ChannelHeaders, "<channel/>")
            .await;
        assert!(err.is_err());
        assert!(!buffer.to_string_lossy().contains("<channel/>"));
    }

    #[tokio::test]
    async fn test_fragment_before_prologue_rejected() {
        let (writer, _) = memory_writer();
        assert!(writer
            .write_fragment(FragmentKind::ChannelHeaders, "<channel/>")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (writer, buffer) = memory_writer();
        writer.write_prologue().await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(buffer.to_string_lossy().matches("</tv>").count(), 1);
        assert!(writer.is_closed().await);
        assert!(writer
            .write_fragment(FragmentKind::Programs, "<programme/>")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_without_prologue_is_well_formed() {
        let (writer, buffer) = memory_writer();
        writer.close().await.unwrap();
        let doc = buffer.to_string_lossy();
        assert!(doc.starts_with("<?xml"));
        assert!(doc.contains("<tv generator-info-name=\"test\">"));
        assert!(doc.ends_with("</tv>\n"));
    }

    #[tokio::test]
    async fn test_with_document_closes_on_error() {
        let (writer, buffer) = memory_writer();
        let result: AppResult<()> = with_document(writer.clone(), |w| async move {
            w.write_prologue().await?;
            Err(AppError::Interrupted)
        })
        .await;
        assert!(matches!(result, Err(AppError::Interrupted)));
        assert!(buffer.to_string_lossy().ends_with("</tv>\n"));
    }

    #[tokio::test]
    async fn test_sink_failure_is_reported() {
        let sink = OutputSink::from_writer(FailingSink { budget: 16 }, "failing");
        let writer = Arc::new(XmltvWriter::new(sink, "test"));
        let err = writer.write_prologue().await.unwrap_err();
        assert!(matches!(err, AppError::Sink(_)));
        assert!(err.is_fatal());
        // finalizer still runs, and reports the dead sink
        assert!(writer.close().await.is_err());
        assert!(writer.is_closed().await);
    }
}
