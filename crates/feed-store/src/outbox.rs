use chrono::Utc;
use rusqlite::Transaction;
use tracing::{instrument, warn};

use feed_core::event::FeedEvent;
use feed_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;

/// Durable holding area for telemetry that could not be delivered before a
/// session ended. Rows are returned in insertion order.
///
/// Reading does not remove anything: [`OutboxRepo::load`] hands out the rows
/// together with a watermark, and the caller acknowledges the watermark once
/// the events were delivered or stashed again.
#[derive(Clone)]
pub struct OutboxRepo {
    db: Database,
}

/// Events read back from the outbox.
#[derive(Debug, Default)]
pub struct Stashed {
    pub events: Vec<FeedEvent>,
    /// Highest row id covered by `events`; pass it to [`OutboxRepo::ack`].
    pub watermark: Option<i64>,
    /// Rows whose payload could not be decoded. They are deleted on load.
    pub skipped: usize,
}

impl OutboxRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append `events` in order. Returns the number of rows written.
    pub fn stash(&self, session_id: &SessionId, events: &[FeedEvent]) -> Result<usize, StoreError> {
        self.restash(session_id, events, None)
    }

    /// Append `events` and drop every row up to `watermark` in one
    /// transaction, so re-stashed events are never held twice.
    #[instrument(skip(self, events), fields(session_id = %session_id, count = events.len()))]
    pub fn restash(
        &self,
        session_id: &SessionId,
        events: &[FeedEvent],
        watermark: Option<i64>,
    ) -> Result<usize, StoreError> {
        if events.is_empty() && watermark.is_none() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            if let Some(up_to) = watermark {
                tx.execute("DELETE FROM event_outbox WHERE id <= ?1", [up_to])?;
            }
            insert_events(&tx, session_id, events, &now)?;
            tx.commit()?;
            Ok(events.len())
        })
    }

    /// Every stashed event, oldest first. Undecodable rows are logged,
    /// counted in [`Stashed::skipped`], and deleted.
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<Stashed, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let rows: Vec<(i64, String)> = {
                let mut stmt = tx.prepare("SELECT id, payload FROM event_outbox ORDER BY id ASC")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut stashed = Stashed::default();
            for (id, raw) in rows {
                match serde_json::from_str::<FeedEvent>(&raw) {
                    Ok(event) => {
                        stashed.events.push(event);
                        stashed.watermark = Some(id);
                    }
                    Err(e) => {
                        let err = StoreError::CorruptRow {
                            table: "event_outbox",
                            column: "payload",
                            detail: format!("row {id}: invalid JSON: {e}"),
                        };
                        warn!(error = %err, "dropping undecodable outbox row");
                        tx.execute("DELETE FROM event_outbox WHERE id = ?1", [id])?;
                        stashed.skipped += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(stashed)
        })
    }

    /// Delete every row up to and including `watermark`.
    pub fn ack(&self, watermark: i64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM event_outbox WHERE id <= ?1", [watermark])?;
            Ok(n)
        })
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM event_outbox", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }
}

fn insert_events(
    tx: &Transaction<'_>,
    session_id: &SessionId,
    events: &[FeedEvent],
    now: &str,
) -> Result<(), StoreError> {
    let mut stmt = tx.prepare(
        "INSERT INTO event_outbox (session_id, payload, created_at) VALUES (?1, ?2, ?3)",
    )?;
    for event in events {
        let payload = serde_json::to_string(event)?;
        stmt.execute(rusqlite::params![session_id.as_str(), payload, now])?;
    }
    Ok(())
}
