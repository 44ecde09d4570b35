//! Idempotent schema setup: `CREATE TABLE IF NOT EXISTS` plus column checks.

use rusqlite::Connection;
use tracing::{info, warn};

const TABLES: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS subscriptions (
    user_id INTEGER PRIMARY KEY,
    paid_until INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS free_users (
    user_id INTEGER PRIMARY KEY,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    chat_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY(chat_id, message_id)
);
CREATE TABLE IF NOT EXISTS media (
    chat_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY(chat_id, message_id)
);
CREATE TABLE IF NOT EXISTS forwarded (
    recipient_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    tag TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY(recipient_id, message_id, tag)
);
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    username TEXT,
    name TEXT,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    blocked INTEGER NOT NULL DEFAULT 0,
    bot_user INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,
    action TEXT NOT NULL,
    chat_id INTEGER,
    message_id INTEGER,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pending_inputs (
    user_id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS business_connections (
    connection_id TEXT PRIMARY KEY,
    owner_user_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    notified INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS owner_chats (
    owner_user_id INTEGER NOT NULL,
    chat_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY(owner_user_id, chat_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_created ON messages(chat_id, created_at);
CREATE INDEX IF NOT EXISTS idx_media_created ON media(created_at);
CREATE INDEX IF NOT EXISTS idx_events_action ON events(action);
";

/// Columns added after the first release: (table, column, definition).
const ADDED_COLUMNS: [(&str, &str, &str); 3] = [
    ("users", "blocked", "INTEGER NOT NULL DEFAULT 0"),
    ("users", "bot_user", "INTEGER NOT NULL DEFAULT 0"),
    ("business_connections", "notified", "INTEGER NOT NULL DEFAULT 0"),
];

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(TABLES)?;
    for (table, column, definition) in ADDED_COLUMNS {
        if columns(conn, table)?.iter().any(|c| c == column) {
            continue;
        }
        info!(table, column, "Adding missing column");
        if let Err(e) = conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
            [],
        ) {
            warn!(table, column, error = %e, "Failed to add column");
        }
    }
    Ok(())
}

fn columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_twice_is_harmless() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let cols = columns(&conn, "business_connections").unwrap();
        assert!(cols.iter().any(|c| c == "notified"));
    }

    #[test]
    fn old_users_table_gets_new_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (user_id INTEGER PRIMARY KEY, username TEXT, name TEXT,
             first_seen INTEGER NOT NULL, last_seen INTEGER NOT NULL);
             INSERT INTO users VALUES (5, 'ann', 'Ann', 1, 1);",
        )
        .unwrap();
        migrate(&conn).unwrap();
        let (blocked, bot_user): (i64, i64) = conn
            .query_row(
                "SELECT blocked, bot_user FROM users WHERE user_id = 5",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((blocked, bot_user), (0, 0));
    }
}
