use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use relay_core::{ChatMessage, MessageLog, RelayError};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Source of "now" for message timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Append-only chat message log backed by the `messages` table.
pub struct MessageRepo {
    db: Database,
    /// Append critical section. Holds the newest persisted `created_at`,
    /// loaded from the table on first use.
    last_created_at: Mutex<Option<DateTime<Utc>>>,
    clock: Clock,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self::with_clock(db, Arc::new(Utc::now))
    }

    pub fn with_clock(db: Database, clock: Clock) -> Self {
        Self {
            db,
            last_created_at: Mutex::new(None),
            clock,
        }
    }

    /// Persist a message. The timestamp is the current time, clamped so it
    /// never precedes the newest message already in the log.
    #[instrument(skip(self, body), fields(author = %author))]
    pub fn append(&self, author: &str, body: &str) -> Result<ChatMessage, StoreError> {
        let mut last = self.last_created_at.lock();

        self.db.with_conn(|conn| {
            let floor = match *last {
                Some(ts) => Some(ts),
                None => latest_created_at(conn)?,
            };

            let now = row_helpers::truncate_to_micros((self.clock)());
            let created_at = match floor {
                Some(prev) if prev > now => {
                    debug!(%prev, %now, "clock behind newest message, clamping");
                    prev
                }
                _ => now,
            };

            conn.execute(
                "INSERT INTO messages (author, body, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![author, body, row_helpers::format_timestamp(&created_at)],
            )?;
            let id = conn.last_insert_rowid();
            *last = Some(created_at);

            Ok(ChatMessage {
                id,
                author: author.to_string(),
                body: body.to_string(),
                created_at,
            })
        })
    }

    /// Every message, oldest first.
    #[instrument(skip(self))]
    pub fn list_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, author, body, created_at FROM messages
                 ORDER BY created_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }
}

impl MessageLog for MessageRepo {
    fn append(&self, author: &str, body: &str) -> Result<ChatMessage, RelayError> {
        Ok(MessageRepo::append(self, author, body)?)
    }

    fn list_all(&self) -> Result<Vec<ChatMessage>, RelayError> {
        Ok(MessageRepo::list_all(self)?)
    }

    fn count(&self) -> Result<u64, RelayError> {
        Ok(MessageRepo::count(self)?)
    }
}

fn latest_created_at(conn: &rusqlite::Connection) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT created_at FROM messages ORDER BY created_at DESC, id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| row_helpers::parse_timestamp(&s, "messages", "created_at"))
        .transpose()
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    let created_at: String = row_helpers::get(row, 3, "messages", "created_at")?;
    Ok(ChatMessage {
        id: row_helpers::get(row, 0, "messages", "id")?,
        author: row_helpers::get(row, 1, "messages", "author")?,
        body: row_helpers::get(row, 2, "messages", "body")?,
        created_at: row_helpers::parse_timestamp(&created_at, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock that returns whatever second offset the test sets.
    fn manual_clock() -> (Clock, Arc<AtomicI64>) {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let offset = Arc::new(AtomicI64::new(0));
        let handle = Arc::clone(&offset);
        let clock: Clock =
            Arc::new(move || base + Duration::seconds(handle.load(Ordering::SeqCst)));
        (clock, offset)
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let repo = MessageRepo::new(Database::in_memory().unwrap());
        let m1 = repo.append("a", "one").unwrap();
        let m2 = repo.append("b", "two").unwrap();
        let m3 = repo.append("a", "three").unwrap();

        assert!(m1.id < m2.id && m2.id < m3.id);
        assert!(m1.created_at <= m2.created_at && m2.created_at <= m3.created_at);
        assert_eq!(m2.author, "b");
        assert_eq!(m2.body, "two");
    }

    #[test]
    fn append_clamps_backwards_clock() {
        let (clock, offset) = manual_clock();
        let repo = MessageRepo::with_clock(Database::in_memory().unwrap(), clock);

        offset.store(100, Ordering::SeqCst);
        let m1 = repo.append("a", "later").unwrap();

        offset.store(10, Ordering::SeqCst);
        let m2 = repo.append("a", "skewed").unwrap();

        assert!(m1.id < m2.id);
        assert_eq!(m2.created_at, m1.created_at);

        offset.store(200, Ordering::SeqCst);
        let m3 = repo.append("a", "recovered").unwrap();
        assert!(m3.created_at > m2.created_at);
    }

    #[test]
    fn clamp_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        let (clock, offset) = manual_clock();
        offset.store(500, Ordering::SeqCst);
        let first = MessageRepo::with_clock(Database::open(&path).unwrap(), Arc::clone(&clock))
            .append("a", "before restart")
            .unwrap();

        offset.store(0, Ordering::SeqCst);
        let repo = MessageRepo::with_clock(Database::open(&path).unwrap(), clock);
        let second = repo.append("a", "after restart").unwrap();

        assert!(second.id > first.id);
        assert!(second.created_at >= first.created_at);
    }

    #[test]
    fn list_all_orders_by_timestamp_then_id() {
        let (clock, offset) = manual_clock();
        let repo = MessageRepo::with_clock(Database::in_memory().unwrap(), clock);

        offset.store(5, Ordering::SeqCst);
        repo.append("a", "1").unwrap();
        repo.append("b", "2").unwrap(); // same instant, ordered by id
        offset.store(6, Ordering::SeqCst);
        repo.append("c", "3").unwrap();

        let bodies: Vec<String> = repo.list_all().unwrap().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["1", "2", "3"]);
    }

    #[test]
    fn list_all_reads_durable_state() {
        let db = Database::in_memory().unwrap();
        let writer = MessageRepo::new(db.clone());
        let reader = MessageRepo::new(db);

        assert!(reader.list_all().unwrap().is_empty());
        let stored = writer.append("a", "hi").unwrap();

        let listed = reader.list_all().unwrap();
        assert_eq!(listed, vec![stored]);
    }

    #[test]
    fn listed_message_equals_appended_message() {
        let repo = MessageRepo::new(Database::in_memory().unwrap());
        let stored = repo.append("a", "hi").unwrap();
        assert_eq!(repo.list_all().unwrap()[0], stored);
    }

    #[test]
    fn messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        let stored = MessageRepo::new(Database::open(&path).unwrap())
            .append("a", "persist me")
            .unwrap();

        let repo = MessageRepo::new(Database::open(&path).unwrap());
        assert_eq!(repo.list_all().unwrap(), vec![stored]);
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn failed_write_is_store_unavailable() {
        let db = Database::in_memory().unwrap();
        let repo = MessageRepo::new(db.clone());
        db.with_conn(|conn| conn.execute_batch("DROP TABLE messages").map_err(StoreError::from))
            .unwrap();

        let err = MessageLog::append(&repo, "a", "lost").unwrap_err();
        assert!(matches!(err, RelayError::StoreUnavailable(_)));
    }

    #[test]
    fn concurrent_appends_are_totally_ordered() {
        let repo = Arc::new(MessageRepo::new(Database::in_memory().unwrap()));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let repo = Arc::clone(&repo);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        repo.append(&format!("t{t}"), &i.to_string()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let all = repo.list_all().unwrap();
        assert_eq!(all.len(), 100);
        for w in all.windows(2) {
            assert!(w[0].id < w[1].id, "ids out of order");
            assert!(w[0].created_at <= w[1].created_at, "timestamps out of order");
        }
    }
}
