//! Ordered, single-consumer output streams
//!
//! A producer pushes chunks through a [`StreamWriter`]; the consumer pulls them
//! back out of the paired [`OutputStream`] one at a time. Every call to
//! [`ChunkSource::next`] yields a fresh chunk, so a stream is read with an
//! explicit `next().await` loop rather than awaited once like a future.
//!
//! [`FilteredView`]s skip ahead over the *same* cursor as the stream they were
//! derived from. Whatever a view skips or returns is gone for the stream and
//! every sibling view too.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::error::ProcessError;

/// Which pipe a chunk was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// One read event worth of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    index: usize,
    source: StreamSource,
    text: String,
}

impl Chunk {
    /// Position of this chunk in its stream, starting at zero
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> StreamSource {
        self.source
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }
}

impl AsRef<str> for Chunk {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Default)]
struct Buffer {
    chunks: Vec<Chunk>,
    /// Index of the next unconsumed chunk, shared by the stream and all views
    cursor: usize,
    closed: bool,
    /// Set while a read lease is outstanding
    leased: bool,
}

#[derive(Debug, Default)]
struct Shared {
    buffer: Mutex<Buffer>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        // Nothing panics while holding the lock, but keep serving chunks if
        // a caller ever does.
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Create a connected writer/stream pair.
pub fn channel() -> (StreamWriter, OutputStream) {
    let shared = Arc::new(Shared::default());
    (
        StreamWriter {
            shared: Arc::clone(&shared),
        },
        OutputStream { shared },
    )
}

/// Producer half of an output stream
#[derive(Debug, Clone)]
pub struct StreamWriter {
    shared: Arc<Shared>,
}

impl StreamWriter {
    /// Append a chunk and wake the reader if it is waiting for one.
    ///
    /// Returns `false` without storing anything once the stream is closed.
    pub fn append(&self, source: StreamSource, text: impl Into<String>) -> bool {
        {
            let mut buffer = self.shared.lock();
            if buffer.closed {
                tracing::trace!("Dropping chunk appended after close");
                return false;
            }
            let index = buffer.chunks.len();
            buffer.chunks.push(Chunk {
                index,
                source,
                text: text.into(),
            });
            tracing::trace!("Appended chunk {} from {:?}", index, source);
        }
        self.shared.changed.notify_waiters();
        true
    }

    /// Mark the end of output. Pending and future reads past the last chunk
    /// fail with [`ProcessError::StreamClosed`].
    pub fn close(&self) {
        {
            let mut buffer = self.shared.lock();
            if buffer.closed {
                return;
            }
            buffer.closed = true;
            tracing::trace!("Closed stream after {} chunks", buffer.chunks.len());
        }
        self.shared.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// Proof that the holder is the only reader of a stream.
///
/// Obtained by [`ChunkSource::next`] and released when dropped, including
/// when the read future is cancelled.
pub struct ReadLease<'a> {
    shared: &'a Shared,
}

impl<'a> ReadLease<'a> {
    fn acquire(shared: &'a Shared) -> Result<Self, ProcessError> {
        let mut buffer = shared.lock();
        if buffer.leased {
            return Err(ProcessError::ConcurrentRead);
        }
        buffer.leased = true;
        Ok(Self { shared })
    }

    fn guards(&self, shared: &Shared) -> bool {
        std::ptr::eq(self.shared, shared)
    }
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        self.shared.lock().leased = false;
    }
}

/// Anything chunks can be pulled from: an [`OutputStream`] or a view of one.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// The stream whose cursor this source advances
    fn root(&self) -> &OutputStream;

    /// Read the next chunk while the caller already holds the root's lease.
    async fn next_leased(&self, lease: &ReadLease<'_>) -> Result<Chunk, ProcessError>;

    /// Wait for and consume the next chunk this source yields.
    ///
    /// Fails with [`ProcessError::ConcurrentRead`] if another read on the same
    /// stream is still pending, and with [`ProcessError::StreamClosed`] once
    /// the producer is done and nothing is left. Dropping the returned future
    /// consumes nothing.
    async fn next(&self) -> Result<Chunk, ProcessError> {
        let lease = ReadLease::acquire(&self.root().shared)?;
        self.next_leased(&lease).await
    }

    /// Like [`ChunkSource::next`], giving up with [`ProcessError::Timeout`].
    async fn next_timeout(&self, timeout: Duration) -> Result<Chunk, ProcessError> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Timeout(timeout)),
        }
    }

    /// Derive a view that skips chunks until `predicate` accepts one.
    fn filter<P>(&self, predicate: P) -> FilteredView<Self>
    where
        Self: Clone + Sized,
        P: Fn(&Chunk) -> bool + Send + Sync + 'static,
    {
        FilteredView {
            parent: self.clone(),
            predicate: Arc::new(predicate),
        }
    }
}

/// Consumer half of an output stream.
///
/// Clones share the buffer and the cursor; they are handles to one stream,
/// not independent readers.
#[derive(Debug, Clone)]
pub struct OutputStream {
    shared: Arc<Shared>,
}

impl OutputStream {
    /// Number of chunks appended so far
    pub fn received(&self) -> usize {
        self.shared.lock().chunks.len()
    }

    /// Index of the next chunk `next` will return
    pub fn position(&self) -> usize {
        self.shared.lock().cursor
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Copy of every chunk appended so far, consumed or not.
    pub fn history(&self) -> Vec<Chunk> {
        self.shared.lock().chunks.clone()
    }

    /// All text appended so far, concatenated in arrival order.
    pub fn text(&self) -> String {
        self.shared
            .lock()
            .chunks
            .iter()
            .map(Chunk::text)
            .collect()
    }

    fn take(&self) -> Option<Result<Chunk, ProcessError>> {
        let mut buffer = self.shared.lock();
        if let Some(chunk) = buffer.chunks.get(buffer.cursor).cloned() {
            buffer.cursor += 1;
            Some(Ok(chunk))
        } else if buffer.closed {
            Some(Err(ProcessError::StreamClosed {
                consumed: buffer.cursor,
            }))
        } else {
            None
        }
    }
}

#[async_trait]
impl ChunkSource for OutputStream {
    fn root(&self) -> &OutputStream {
        self
    }

    async fn next_leased(&self, lease: &ReadLease<'_>) -> Result<Chunk, ProcessError> {
        debug_assert!(
            lease.guards(&self.shared),
            "read lease belongs to a different stream"
        );
        loop {
            // Register interest before checking so an append between the
            // check and the await still wakes us.
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(result) = self.take() {
                return result;
            }
            changed.await;
        }
    }
}

pub type Predicate = Arc<dyn Fn(&Chunk) -> bool + Send + Sync>;

/// A view that only yields chunks matching a predicate.
///
/// It owns no position of its own: each `next` drives the parent's cursor
/// forward, permanently consuming the chunks it skips.
pub struct FilteredView<S> {
    parent: S,
    predicate: Predicate,
}

impl<S: Clone> Clone for FilteredView<S> {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<S> fmt::Debug for FilteredView<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredView")
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: ChunkSource> ChunkSource for FilteredView<S> {
    fn root(&self) -> &OutputStream {
        self.parent.root()
    }

    async fn next_leased(&self, lease: &ReadLease<'_>) -> Result<Chunk, ProcessError> {
        loop {
            let chunk = self.parent.next_leased(lease).await?;
            if (self.predicate)(&chunk) {
                return Ok(chunk);
            }
            tracing::trace!("Skipping chunk {}", chunk.index());
        }
    }
}
