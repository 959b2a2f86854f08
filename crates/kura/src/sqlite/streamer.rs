use super::database::{sql_err, SqliteDatabase};
use crate::locks::KeyedLocks;
use crate::signals::StreamSignals;
use async_trait::async_trait;
use bytes::Bytes;
use kura_core::{ChunkStream, Result, RunId, Streamer, WorldError};
use rusqlite::{params, Connection, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Next free chunk index of a stream and whether it is closed.
fn head(conn: &Connection, name: &str) -> rusqlite::Result<(i64, bool)> {
    conn.query_row(
        "SELECT COALESCE(MAX(idx) + 1, 0), COALESCE(MAX(eof), 0) FROM stream_chunks WHERE name = ?1",
        [name],
        |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
    )
}

fn insert(conn: &Connection, name: &str, idx: i64, owner: &str, data: &[u8], eof: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO stream_chunks (name, idx, owner, data, eof) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![name, idx, owner, data, eof],
    )
    .map_err(sql_err)?;
    Ok(())
}

struct Chunk {
    idx: i64,
    data: Vec<u8>,
    eof: bool,
}

async fn chunks_from(db: &SqliteDatabase, name: &str, position: i64) -> Result<Vec<Chunk>> {
    let name = name.to_string();
    db.call(move |conn| {
        let mut statement = conn
            .prepare_cached(
                "SELECT idx, data, eof FROM stream_chunks WHERE name = ?1 AND idx >= ?2 ORDER BY idx",
            )
            .map_err(sql_err)?;
        let chunks = statement
            .query_map(params![name, position], |row| {
                Ok(Chunk {
                    idx: row.get(0)?,
                    data: row.get(1)?,
                    eof: row.get(2)?,
                })
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(chunks)
    })
    .await
}

/// [`Streamer`] in the `stream_chunks` table.
///
/// Chunks are rows indexed from 0; closing appends an empty row with the
/// `eof` flag. Readers in this process wake on writes; readers of writes made
/// by another process notice them on the next poll.
#[derive(Debug, Clone)]
pub struct SqliteStreamer {
    db: SqliteDatabase,
    locks: Arc<KeyedLocks>,
    signals: StreamSignals,
    poll_interval: Duration,
}

impl SqliteStreamer {
    pub fn new(db: SqliteDatabase, poll_interval: Duration) -> Self {
        Self {
            db,
            locks: Arc::new(KeyedLocks::new()),
            signals: StreamSignals::new(),
            poll_interval,
        }
    }
}

#[async_trait]
impl Streamer for SqliteStreamer {
    async fn write_to_stream(&self, name: &str, owner: &RunId, chunk: Bytes) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        let stream_name = name.to_string();
        let owner = owner.clone();
        self.db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err)?;
                let (next, closed) = head(&tx, &stream_name).map_err(sql_err)?;
                if closed {
                    return Err(WorldError::StreamClosed { name: stream_name });
                }
                insert(&tx, &stream_name, next, owner.as_str(), &chunk, false)?;
                tx.commit().map_err(sql_err)
            })
            .await?;
        self.signals.notify(name);
        Ok(())
    }

    async fn close_stream(&self, name: &str, owner: &RunId) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        let stream_name = name.to_string();
        let owner = owner.clone();
        let closed_now = self
            .db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err)?;
                let (next, closed) = head(&tx, &stream_name).map_err(sql_err)?;
                if closed {
                    return Ok(false);
                }
                insert(&tx, &stream_name, next, owner.as_str(), &[], true)?;
                tx.commit().map_err(sql_err)?;
                Ok(true)
            })
            .await?;
        if closed_now {
            info!("Stream '{}' closed", name);
            self.signals.notify(name);
        } else {
            debug!("Stream '{}' is already closed", name);
        }
        Ok(())
    }

    async fn read_from_stream(&self, name: &str) -> Result<ChunkStream> {
        let mut subscription = self.signals.subscribe(name);
        let db = self.db.clone();
        let poll_interval = self.poll_interval;
        let stream_name = name.to_string();
        let chunks = async_stream::stream! {
            let mut position = 0;
            'read: loop {
                let batch = match chunks_from(&db, &stream_name, position).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        yield Err(e);
                        break 'read;
                    }
                };
                for chunk in batch {
                    if chunk.eof {
                        break 'read;
                    }
                    position = chunk.idx + 1;
                    yield Ok::<Bytes, WorldError>(Bytes::from(chunk.data));
                }
                subscription.changed_within(poll_interval).await;
            }
        };
        Ok(ChunkStream::new(name, chunks))
    }

    async fn list_streams(&self, owner: &RunId) -> Result<Vec<String>> {
        let owner = owner.clone();
        self.db
            .call(move |conn| {
                let mut statement = conn
                    // The first row, a chunk or the eof of a close, names the owner.
                    .prepare_cached(
                        "SELECT name FROM stream_chunks WHERE owner = ?1 AND idx = 0 ORDER BY name",
                    )
                    .map_err(sql_err)?;
                let names = statement
                    .query_map([owner.as_str()], |row| row.get::<_, String>(0))
                    .map_err(sql_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(sql_err)?;
                Ok(names)
            })
            .await
    }

    fn subscriber_count(&self, name: &str) -> usize {
        self.signals.subscriber_count(name)
    }
}
