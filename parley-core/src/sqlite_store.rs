// ABOUTME: SQLite-backed SessionStore persisting sessions with JSON-encoded metadata and messages.
// ABOUTME: One shared connection behind a mutex; every read-modify-write runs under that lock.
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::session::{session_id, Session, SessionStore};

#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<Mutex<Connection>>,
}

struct SessionRow {
    id: String,
    channel_type: String,
    chat_id: String,
    metadata_json: String,
    messages_json: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            metadata: serde_json::from_str(&self.metadata_json)
                .with_context(|| format!("Corrupt metadata for session {}", self.id))?,
            messages: serde_json::from_str(&self.messages_json)
                .with_context(|| format!("Corrupt messages for session {}", self.id))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            channel_type: self.channel_type,
            chat_id: self.chat_id,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp in session store: {}", raw))?
        .with_timezone(&Utc))
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

const SELECT_COLUMNS: &str =
    "SELECT id, channel_type, chat_id, metadata_json, messages_json, created_at, updated_at FROM sessions";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        channel_type: row.get(1)?,
        chat_id: row.get(2)?,
        metadata_json: row.get(3)?,
        messages_json: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn load(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let row = conn
        .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), params![id], read_row)
        .optional()
        .context("Failed to query session")?;
    row.map(SessionRow::into_session).transpose()
}

fn write(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, channel_type, chat_id, metadata_json, messages_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            channel_type = excluded.channel_type,
            chat_id = excluded.chat_id,
            metadata_json = excluded.metadata_json,
            messages_json = excluded.messages_json,
            updated_at = excluded.updated_at",
        params![
            session.id,
            session.channel_type,
            session.chat_id,
            serde_json::to_string(&session.metadata)?,
            serde_json::to_string(&session.messages)?,
            format_timestamp(&session.created_at),
            format_timestamp(&session.updated_at),
        ],
    )
    .with_context(|| format!("Failed to write session {}", session.id))?;
    Ok(())
}

impl SqliteSessionStore {
    /// Open (or create) the database at `db_path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path).context("Failed to open SQLite database")?;
        let store = Self::with_connection(conn)?;
        tracing::info!(db = %db_path.display(), "SessionStore initialized");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                channel_type TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                messages_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_channel ON sessions(channel_type)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    fn query_sessions(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Session>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(sql)?;
        let rows = stmt
            .query_map(args, read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }
}

impl SessionStore for SqliteSessionStore {
    fn get_or_create(&self, channel_type: &str, conversation_key: &str) -> Result<Session> {
        let db = self.conn()?;
        let id = session_id(channel_type, conversation_key);
        if let Some(existing) = load(&db, &id)? {
            return Ok(existing);
        }
        let session = Session::new(channel_type, conversation_key);
        write(&db, &session)?;
        tracing::debug!(session_id = %session.id, "Created session");
        Ok(session)
    }

    fn get(&self, id: &str) -> Result<Option<Session>> {
        let db = self.conn()?;
        load(&db, id)
    }

    fn save(&self, session: &Session) -> Result<()> {
        let db = self.conn()?;
        write(&db, session)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let db = self.conn()?;
        let affected = db
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to delete session {}", id))?;
        Ok(affected > 0)
    }

    fn list_all(&self) -> Result<Vec<Session>> {
        self.query_sessions(&format!("{} ORDER BY created_at, id", SELECT_COLUMNS), &[])
    }

    fn list_by_channel_type(&self, channel_type: &str) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "{} WHERE channel_type = ?1 ORDER BY created_at, id",
                SELECT_COLUMNS
            ),
            &[&channel_type],
        )
    }

    fn compact_messages(&self, id: &str, keep_last: usize) -> Result<Option<usize>> {
        let db = self.conn()?;
        let Some(mut session) = load(&db, id)? else {
            return Ok(None);
        };
        let removed = session.compact(keep_last);
        if removed > 0 {
            write(&db, &session)?;
        }
        Ok(Some(removed))
    }

    fn clear_messages(&self, id: &str) -> Result<bool> {
        let db = self.conn()?;
        let Some(mut session) = load(&db, id)? else {
            return Ok(false);
        };
        session.clear_messages();
        write(&db, &session)?;
        Ok(true)
    }
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}
