use crate::signals::StreamSignals;
use async_trait::async_trait;
use bytes::Bytes;
use kura_core::{ChunkStream, Result, RunId, Streamer, WorldError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug)]
struct StreamBuffer {
    owner: RunId,
    chunks: Vec<Bytes>,
    closed: bool,
}

impl StreamBuffer {
    fn new(owner: &RunId) -> Self {
        Self {
            owner: owner.clone(),
            chunks: Vec::new(),
            closed: false,
        }
    }
}

type Buffers = Arc<Mutex<HashMap<String, StreamBuffer>>>;

enum Cursor {
    Chunk(Bytes),
    Closed,
    Pending,
}

fn cursor(buffers: &Buffers, name: &str, position: usize) -> Cursor {
    let buffers = buffers.lock().unwrap_or_else(PoisonError::into_inner);
    match buffers.get(name) {
        Some(buffer) => match buffer.chunks.get(position) {
            Some(chunk) => Cursor::Chunk(chunk.clone()),
            None if buffer.closed => Cursor::Closed,
            None => Cursor::Pending,
        },
        None => Cursor::Pending,
    }
}

/// Process-local [`Streamer`].
///
/// A stream exists once it is written or closed; reading a name nobody has
/// written yet waits for it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStreamer {
    buffers: Buffers,
    signals: StreamSignals,
}

impl MemoryStreamer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Streamer for MemoryStreamer {
    async fn write_to_stream(&self, name: &str, owner: &RunId, chunk: Bytes) -> Result<()> {
        {
            let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            let buffer = buffers
                .entry(name.to_string())
                .or_insert_with(|| StreamBuffer::new(owner));
            if buffer.closed {
                return Err(WorldError::StreamClosed {
                    name: name.to_string(),
                });
            }
            buffer.chunks.push(chunk);
        }
        self.signals.notify(name);
        Ok(())
    }

    async fn close_stream(&self, name: &str, owner: &RunId) -> Result<()> {
        {
            let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            let buffer = buffers
                .entry(name.to_string())
                .or_insert_with(|| StreamBuffer::new(owner));
            if buffer.closed {
                debug!("Stream '{}' is already closed", name);
                return Ok(());
            }
            buffer.closed = true;
            info!("Stream '{}' closed after {} chunk(s)", name, buffer.chunks.len());
        }
        self.signals.notify(name);
        Ok(())
    }

    async fn read_from_stream(&self, name: &str) -> Result<ChunkStream> {
        let mut subscription = self.signals.subscribe(name);
        let buffers = Arc::clone(&self.buffers);
        let stream_name = name.to_string();
        let chunks = async_stream::stream! {
            let mut position = 0;
            loop {
                match cursor(&buffers, &stream_name, position) {
                    Cursor::Chunk(chunk) => {
                        position += 1;
                        yield Ok::<Bytes, WorldError>(chunk);
                    }
                    Cursor::Closed => break,
                    Cursor::Pending => subscription.changed().await,
                }
            }
        };
        Ok(ChunkStream::new(name, chunks))
    }

    async fn list_streams(&self, owner: &RunId) -> Result<Vec<String>> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = buffers
            .iter()
            .filter(|(_, buffer)| &buffer.owner == owner)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn subscriber_count(&self, name: &str) -> usize {
        self.signals.subscriber_count(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_write() {
        let streamer = MemoryStreamer::new();
        let owner: RunId = "wrun_1".into();
        let mut reader = streamer.read_from_stream("out").await.unwrap();

        {
            let mut next = tokio_test::task::spawn(reader.next_chunk());
            assert_pending!(next.poll());

            streamer
                .write_to_stream("out", &owner, Bytes::from_static(b"hello"))
                .await
                .unwrap();
            assert!(next.is_woken());
            let chunk = assert_ready!(next.poll()).unwrap();
            assert_eq!(chunk, Some(Bytes::from_static(b"hello")));
        }

        streamer.close_stream("out", &owner).await.unwrap();
        assert_eq!(reader.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropping_reader_releases_subscription() {
        let streamer = MemoryStreamer::new();
        let reader = streamer.read_from_stream("out").await.unwrap();
        assert_eq!(streamer.subscriber_count("out"), 1);
        drop(reader);
        assert_eq!(streamer.subscriber_count("out"), 0);
    }

    #[tokio::test]
    async fn test_close_without_writes_creates_closed_stream() {
        let streamer = MemoryStreamer::new();
        let owner: RunId = "wrun_1".into();
        streamer.close_stream("empty", &owner).await.unwrap();
        let reader = streamer.read_from_stream("empty").await.unwrap();
        assert!(reader.collect_chunks().await.unwrap().is_empty());
        assert_eq!(
            streamer.list_streams(&owner).await.unwrap(),
            vec!["empty".to_string()]
        );
    }
}
