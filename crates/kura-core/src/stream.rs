//! Readable byte-chunk sequence returned by a [`Streamer`](crate::Streamer).

use crate::error::{EntityKind, Result, WorldError};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Lazy, ordered sequence of the chunks written to one stream.
///
/// Always starts at the first chunk. It ends once the stream is closed and
/// every chunk has been yielded; until then it waits for more writes.
/// Dropping it cancels the read and releases the subscription.
pub struct ChunkStream {
    name: String,
    inner: BoxStream<'static, Result<Bytes>>,
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ChunkStream {
    pub fn new(
        name: impl Into<String>,
        chunks: impl Stream<Item = Result<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inner: chunks.boxed(),
        }
    }

    /// Name of the stream being read.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next chunk. `Ok(None)` means the stream is closed and drained.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.inner.next().await.transpose()
    }

    /// Like [`next_chunk`](Self::next_chunk), failing with `Timeout` after `limit`.
    pub async fn next_chunk_timeout(&mut self, limit: Duration) -> Result<Option<Bytes>> {
        match tokio::time::timeout(limit, self.next_chunk()).await {
            Ok(chunk) => chunk,
            Err(_) => Err(self.timeout_error()),
        }
    }

    /// Collects every chunk until the stream closes.
    pub async fn collect_chunks(mut self) -> Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Concatenates every chunk until the stream closes.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Like [`read_to_end`](Self::read_to_end) with a deadline; the reader is
    /// dropped, and its subscription released, when the deadline passes.
    pub async fn read_to_end_timeout(self, limit: Duration) -> Result<Bytes> {
        let error = self.timeout_error();
        tokio::time::timeout(limit, self.read_to_end())
            .await
            .map_err(|_| error)?
    }

    fn timeout_error(&self) -> WorldError {
        WorldError::Timeout {
            entity: EntityKind::Stream,
            id: self.name.clone(),
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_read_to_end_concatenates_in_order() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"first\n")),
            Ok(Bytes::from_static(b"second\n")),
        ]);
        let reader = ChunkStream::new("s", chunks);
        assert_eq!(
            reader.read_to_end().await.unwrap(),
            Bytes::from_static(b"first\nsecond\n")
        );
    }

    #[tokio::test]
    async fn test_error_stops_reading() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(WorldError::transient("gone")),
        ]);
        let reader = ChunkStream::new("s", chunks);
        assert!(reader.collect_chunks().await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_on_pending_stream() {
        let mut reader = ChunkStream::new("slow", stream::pending::<Result<Bytes>>());
        let result = reader.next_chunk_timeout(Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(WorldError::Timeout { entity: EntityKind::Stream, ref id }) if id == "slow"
        ));
    }
}
