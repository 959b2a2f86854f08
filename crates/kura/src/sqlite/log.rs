use super::database::{is_constraint_violation, sql_err, to_sql_index, SqliteDatabase};
use crate::log::{AppendOutcome, EventLog};
use async_trait::async_trait;
use kura_core::{value, EntityKind, Event, Result, RunId, WorldError};
use rusqlite::{params, TransactionBehavior};

const INSERT_EVENT: &str =
    "INSERT INTO events (run_id, sequence, kind, body) VALUES (?1, ?2, ?3, ?4)";

/// [`EventLog`] in the `events` table, one row per event keyed by
/// `(run_id, sequence)`.
///
/// The primary key is the arbiter between processes sharing the file: a
/// batch that collides with an existing row is rolled back and reported as
/// [`AppendOutcome::SequenceTaken`].
#[derive(Debug, Clone)]
pub struct SqliteEventLog {
    db: SqliteDatabase,
}

impl SqliteEventLog {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &SqliteDatabase {
        &self.db
    }
}

struct Row {
    sequence: i64,
    kind: &'static str,
    body: Vec<u8>,
}

impl Row {
    fn encode(event: &Event) -> Result<Self> {
        Ok(Self {
            sequence: to_sql_index(event.sequence)?,
            kind: event.kind.name(),
            body: value::encode(event)?,
        })
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn create(&self, first: Event) -> Result<()> {
        let row = Row::encode(&first)?;
        let run_id = first.run_id;
        self.db
            .call(move |conn| {
                match conn.execute(
                    INSERT_EVENT,
                    params![run_id.as_str(), row.sequence, row.kind, row.body],
                ) {
                    Ok(_) => Ok(()),
                    Err(e) if is_constraint_violation(&e) => {
                        Err(WorldError::already_exists(EntityKind::Run, &run_id))
                    }
                    Err(e) => Err(sql_err(e)),
                }
            })
            .await
    }

    async fn append(&self, run_id: &RunId, events: Vec<Event>) -> Result<AppendOutcome> {
        let rows = events.iter().map(Row::encode).collect::<Result<Vec<_>>>()?;
        let run_id = run_id.clone();
        self.db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err)?;
                let head: i64 = tx
                    .query_row(
                        "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE run_id = ?1",
                        [run_id.as_str()],
                        |row| row.get(0),
                    )
                    .map_err(sql_err)?;
                if head == 0 {
                    return Err(WorldError::not_found(EntityKind::Run, &run_id));
                }
                if rows.first().is_some_and(|row| row.sequence != head + 1) {
                    return Ok(AppendOutcome::SequenceTaken);
                }
                for row in &rows {
                    match tx.execute(
                        INSERT_EVENT,
                        params![run_id.as_str(), row.sequence, row.kind, row.body],
                    ) {
                        Ok(_) => {}
                        Err(e) if is_constraint_violation(&e) => {
                            return Ok(AppendOutcome::SequenceTaken)
                        }
                        Err(e) => return Err(sql_err(e)),
                    }
                }
                tx.commit().map_err(sql_err)?;
                Ok(AppendOutcome::Appended)
            })
            .await
    }

    async fn load(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>> {
        let after = to_sql_index(after)?;
        let run_id = run_id.clone();
        let bodies = self
            .db
            .call(move |conn| {
                let mut statement = conn
                    .prepare_cached(
                        "SELECT body FROM events WHERE run_id = ?1 AND sequence > ?2 ORDER BY sequence",
                    )
                    .map_err(sql_err)?;
                let bodies = statement
                    .query_map(params![run_id.as_str(), after], |row| row.get::<_, Vec<u8>>(0))
                    .map_err(sql_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(sql_err)?;
                if bodies.is_empty() {
                    let exists: bool = conn
                        .query_row(
                            "SELECT EXISTS (SELECT 1 FROM events WHERE run_id = ?1)",
                            [run_id.as_str()],
                            |row| row.get(0),
                        )
                        .map_err(sql_err)?;
                    if !exists {
                        return Err(WorldError::not_found(EntityKind::Run, &run_id));
                    }
                }
                Ok(bodies)
            })
            .await?;
        bodies.iter().map(|body| value::decode(body)).collect()
    }

    async fn run_ids(&self) -> Result<Vec<RunId>> {
        self.db
            .call(|conn| {
                let mut statement = conn
                    .prepare("SELECT run_id FROM events WHERE sequence = 1 ORDER BY run_id")
                    .map_err(sql_err)?;
                let ids = statement
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(sql_err)?
                    .map(|id| id.map(RunId::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(sql_err)?;
                Ok(ids)
            })
            .await
    }
}
