//! Detection event log.
//!
//! Every processed frame yields exactly one `DetectionEvent`, positive or
//! negative. Events are appended to a logger; the SQLite logger keeps the
//! `logs` table layout the dashboard reads (`detection` stored as Yes/No).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of inference on one frame, attributed to a subject.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub subject: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Local>,
    pub occurred: bool,
    /// Name of the model that fired, or `none`.
    pub category: String,
}

impl DetectionEvent {
    pub fn new(
        subject: impl Into<String>,
        timestamp: DateTime<Local>,
        occurred: bool,
        category: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            timestamp,
            occurred,
            category: category.into(),
        }
    }

    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

fn serialize_timestamp<S: serde::Serializer>(
    ts: &DateTime<Local>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
}

/// Destination for detection events.
pub trait EventLogger: Send {
    fn record(&mut self, event: &DetectionEvent) -> Result<()>;

    /// Positive events for `subject`, newest first.
    fn recent_detections(&mut self, subject: &str, limit: usize) -> Result<Vec<DetectionEvent>>;
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteEventLog {
    conn: Connection,
}

impl SqliteEventLog {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(db_path)?
        };
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL,
              timestamp TEXT NOT NULL,
              detection TEXT NOT NULL,
              detection_type TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_logs_user_time ON logs(username, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Total rows, positive and negative.
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

impl EventLogger for SqliteEventLog {
    fn record(&mut self, event: &DetectionEvent) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO logs(username, timestamp, detection, detection_type)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event.subject,
                event.timestamp_string(),
                if event.occurred { "Yes" } else { "No" },
                event.category,
            ],
        )?;
        Ok(())
    }

    fn recent_detections(&mut self, subject: &str, limit: usize) -> Result<Vec<DetectionEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT username, timestamp, detection_type FROM logs
            WHERE username = ?1 AND detection = 'Yes'
            ORDER BY timestamp DESC, id DESC LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![subject, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let subject: String = row.get(0)?;
            let raw_ts: String = row.get(1)?;
            let category: String = row.get(2)?;
            out.push(DetectionEvent::new(
                subject,
                parse_timestamp(&raw_ts)?,
                true,
                category,
            ));
        }
        Ok(out)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| anyhow!("corrupt log timestamp '{}': {}", raw, e))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("log timestamp '{}' does not exist in local time", raw))
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryEventLog {
    events: Vec<DetectionEvent>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[DetectionEvent] {
        &self.events
    }
}

impl EventLogger for InMemoryEventLog {
    fn record(&mut self, event: &DetectionEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn recent_detections(&mut self, subject: &str, limit: usize) -> Result<Vec<DetectionEvent>> {
        Ok(self
            .events
            .iter()
            .rev()
            .filter(|ev| ev.occurred && ev.subject == subject)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(offset_s: i64) -> DateTime<Local> {
        let base = Local
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .earliest()
            .expect("valid base time");
        base + Duration::seconds(offset_s)
    }

    #[test]
    fn sqlite_log_stores_yes_no_and_lists_positive_newest_first() -> Result<()> {
        let mut log = SqliteEventLog::open_in_memory()?;
        log.record(&DetectionEvent::new("alice", at(0), false, "none"))?;
        log.record(&DetectionEvent::new("alice", at(1), true, "fire"))?;
        log.record(&DetectionEvent::new("bob", at(2), true, "weapon"))?;
        log.record(&DetectionEvent::new("alice", at(3), true, "weapon"))?;

        assert_eq!(log.count()?, 4);
        let recent = log.recent_detections("alice", 10)?;
        let categories: Vec<&str> = recent.iter().map(|e| e.category.as_str()).collect();
        assert_eq!(categories, vec!["weapon", "fire"]);
        assert_eq!(recent[0].timestamp, at(3));

        let stored: String = log.conn.query_row(
            "SELECT detection FROM logs WHERE detection_type = 'none'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(stored, "No");
        Ok(())
    }

    #[test]
    fn in_memory_log_respects_limit() -> Result<()> {
        let mut log = InMemoryEventLog::new();
        for i in 0..6 {
            log.record(&DetectionEvent::new("alice", at(i), i % 2 == 0, "fire"))?;
        }
        let recent = log.recent_detections("alice", 2)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, at(4));
        Ok(())
    }

    #[test]
    fn event_serializes_with_formatted_timestamp() -> Result<()> {
        let ev = DetectionEvent::new("alice", at(5), true, "fire");
        let json = serde_json::to_value(&ev)?;
        assert_eq!(json["timestamp"], "2025-03-01 12:00:05");
        assert_eq!(json["occurred"], true);
        Ok(())
    }
}
