//! SQLite world backends, durable across restarts.
//!
//! Both tables live in one database file. Several processes may share the
//! file: sequence collisions are settled by the primary key and stream
//! readers poll for writes they were not notified of.

mod database;
mod log;
mod streamer;

pub use database::SqliteDatabase;
pub use log::SqliteEventLog;
pub use streamer::SqliteStreamer;

use crate::engine::EventSourcedStorage;
use kura_core::Result;
use std::path::Path;
use std::time::Duration;

/// How often a blocked reader re-checks the table without a wake-up.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Event-sourced storage in a SQLite file.
pub type SqliteStorage = EventSourcedStorage<SqliteEventLog>;

pub fn create_storage(path: impl AsRef<Path>) -> Result<SqliteStorage> {
    let db = SqliteDatabase::open(path)?;
    Ok(EventSourcedStorage::new(SqliteEventLog::new(db)))
}

pub fn create_streamer(path: impl AsRef<Path>, poll_interval: Duration) -> Result<SqliteStreamer> {
    let db = SqliteDatabase::open(path)?;
    Ok(SqliteStreamer::new(db, poll_interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kura_core::{CreateRun, RunId, RunStatus, StepEventKind, Storage, Streamer, Value};

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.db");

        let run_id = {
            let storage = create_storage(&path).unwrap();
            let run = storage
                .create_run(CreateRun::new("durable", Value::Bytes(vec![0, 1, 2])))
                .await
                .unwrap();
            storage.start_run(&run.run_id).await.unwrap();
            run.run_id
        };

        let storage = create_storage(&path).unwrap();
        let run = storage.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.input, Value::Bytes(vec![0, 1, 2]));
    }

    #[tokio::test]
    async fn test_two_handles_share_one_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.db");
        let first = create_storage(&path).unwrap();
        let second = create_storage(&path).unwrap();

        let run = first
            .create_run(CreateRun::new("shared", Value::Null))
            .await
            .unwrap();
        second.start_run(&run.run_id).await.unwrap();
        first
            .append_step_event(
                &run.run_id,
                &"step_a".into(),
                StepEventKind::Started,
                Value::Null,
            )
            .await
            .unwrap();

        let sequences: Vec<u64> = second
            .list_events(&run.run_id)
            .await
            .unwrap()
            .iter()
            .map(|event| event.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(second.list_steps(&run.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reader_polls_writes_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.db");
        let writer = create_streamer(&path, DEFAULT_POLL_INTERVAL).unwrap();
        let reader = create_streamer(&path, Duration::from_millis(10)).unwrap();
        let owner = RunId::new("wrun_1");

        let chunks = reader.read_from_stream("log").await.unwrap();
        writer
            .write_to_stream("log", &owner, Bytes::from_static(b"a"))
            .await
            .unwrap();
        writer.close_stream("log", &owner).await.unwrap();

        let data = chunks
            .read_to_end_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(data, Bytes::from_static(b"a"));
    }
}
