//! SQLite persistence layer.
//!
//! Stores users (with their online flag), groups and their member lists,
//! messages with delivery status, and reactions. Uses WAL mode for
//! concurrent reads during writes. Domain rules (who may delete, who may
//! react) live one level up in [`crate::store`].

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, Row, params};

use crate::delivery::DeliveryStatus;
use crate::event::{MessageKind, Target};
use crate::store::{GroupRecord, MessageRecord, Reaction, UserRecord};

const MESSAGE_COLUMNS: &str = "id, sender, recipient, group_id, kind, text, file_url, audio_url, \
     reply_to, link_meta_json, status, deleted, created_at";

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing and ephemeral servers).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                is_online   INTEGER NOT NULL DEFAULT 0,
                last_seen   INTEGER,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS groups (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                admin       TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id          TEXT PRIMARY KEY,
                sender      TEXT NOT NULL,
                recipient   TEXT,
                group_id    TEXT,
                kind        TEXT NOT NULL DEFAULT 'text',
                text        TEXT NOT NULL DEFAULT '',
                file_url    TEXT,
                audio_url   TEXT,
                reply_to    TEXT,
                status      INTEGER NOT NULL DEFAULT 0,
                deleted     INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL,
                CHECK ((recipient IS NULL) <> (group_id IS NULL))
            );

            CREATE INDEX IF NOT EXISTS idx_messages_direct
                ON messages(sender, recipient, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_group
                ON messages(group_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS reactions (
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                reactor     TEXT NOT NULL,
                emoji       TEXT NOT NULL,
                PRIMARY KEY (message_id, reactor)
            );
            ",
        )?;

        // Columns added after the first schema. "duplicate column name"
        // errors mean the column already exists.
        let migrations = ["ALTER TABLE messages ADD COLUMN link_meta_json TEXT"];
        for sql in &migrations {
            let _ = self.conn.execute(sql, []);
        }

        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    pub fn insert_user(&self, user: &UserRecord) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (id, username, is_online, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user.id, user.username, user.is_online, user.last_seen, user.created_at],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> SqlResult<Option<UserRecord>> {
        self.conn
            .query_row(
                "SELECT id, username, is_online, last_seen, created_at FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        is_online: row.get(2)?,
                        last_seen: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    /// Set the online flag. `last_seen` is left untouched when `None`.
    /// Returns the number of rows changed (0 = unknown user).
    pub fn update_presence(&self, id: &str, online: bool, last_seen: Option<i64>) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE users SET is_online = ?2, last_seen = COALESCE(?3, last_seen) WHERE id = ?1",
            params![id, online, last_seen],
        )
    }

    // ── Groups ─────────────────────────────────────────────────────────

    pub fn insert_group(&self, group: &GroupRecord) -> SqlResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO groups (id, name, admin, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![group.id, group.name, group.admin, group.created_at],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
            )?;
            for member in &group.members {
                stmt.execute(params![group.id, member])?;
            }
        }
        tx.commit()
    }

    pub fn get_group(&self, id: &str) -> SqlResult<Option<GroupRecord>> {
        let group = self
            .conn
            .query_row(
                "SELECT id, name, admin, created_at FROM groups WHERE id = ?1",
                params![id],
                |row| {
                    Ok(GroupRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        admin: row.get(2)?,
                        members: Vec::new(),
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        let Some(mut group) = group else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY rowid",
        )?;
        group.members = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(Some(group))
    }

    pub fn is_group_member(&self, group_id: &str, user_id: &str) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2)",
            params![group_id, user_id],
            |row| row.get(0),
        )
    }

    /// Groups `user_id` belongs to, oldest first.
    pub fn groups_of(&self, user_id: &str) -> SqlResult<Vec<GroupRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.id FROM groups g
             JOIN group_members m ON m.group_id = g.id
             WHERE m.user_id = ?1
             ORDER BY g.created_at, g.rowid",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<SqlResult<Vec<_>>>()?;
        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(group) = self.get_group(&id)? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    // ── Messages ───────────────────────────────────────────────────────

    pub fn insert_message(&self, msg: &MessageRecord) -> SqlResult<()> {
        let (recipient, group_id) = match &msg.target {
            Target::User(to) => (Some(to.as_str()), None),
            Target::Group(group) => (None, Some(group.as_str())),
        };
        let link_meta_json = msg.link_meta.as_ref().map(|v| v.to_string());
        self.conn.execute(
            "INSERT INTO messages (id, sender, recipient, group_id, kind, text, file_url, audio_url,
                                   reply_to, link_meta_json, status, deleted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                msg.id,
                msg.from,
                recipient,
                group_id,
                msg.message_type.as_str(),
                msg.msg,
                msg.file_url,
                msg.audio_url,
                msg.reply_to,
                link_meta_json,
                msg.status.rank(),
                msg.deleted,
                msg.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> SqlResult<Option<MessageRecord>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], map_message_row)
            .optional()?;
        match row {
            Some(mut msg) => {
                msg.reactions = self.reactions(&msg.id)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Raise a message's status to `status` if it is currently lower.
    /// Returns the number of rows changed.
    pub fn raise_status(&self, id: &str, status: DeliveryStatus) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
            params![id, status.rank()],
        )
    }

    /// Mark every direct message from `sender` to `reader` as read.
    pub fn mark_read(&self, sender: &str, reader: &str) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE messages SET status = ?3
             WHERE sender = ?1 AND recipient = ?2 AND status < ?3",
            params![sender, reader, DeliveryStatus::Read.rank()],
        )
    }

    /// Soft delete: the row stays (so history shows a tombstone) but its
    /// payload is cleared.
    pub fn soft_delete(&self, id: &str) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE messages
             SET deleted = 1, text = '', file_url = NULL, audio_url = NULL, link_meta_json = NULL
             WHERE id = ?1",
            params![id],
        )
    }

    /// Keyset position of a message: `(created_at, rowid)`.
    pub fn cursor_of(&self, id: &str) -> SqlResult<Option<(i64, i64)>> {
        self.conn
            .query_row(
                "SELECT created_at, rowid FROM messages WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
    }

    /// Direct history between `a` and `b`, oldest first.
    /// `before`: only messages strictly older than this keyset position.
    pub fn conversation(
        &self,
        a: &str,
        b: &str,
        before: Option<(i64, i64)>,
        limit: usize,
    ) -> SqlResult<Vec<MessageRecord>> {
        let (before_ts, before_row) = before.unzip();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE ((sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1))
               AND (?3 IS NULL OR created_at < ?3 OR (created_at = ?3 AND rowid < ?4))
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?5"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![a, b, before_ts, before_row, limit as i64],
            map_message_row,
        )?;
        self.finish_page(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    /// Group history, oldest first.
    pub fn group_messages(
        &self,
        group_id: &str,
        before: Option<(i64, i64)>,
        limit: usize,
    ) -> SqlResult<Vec<MessageRecord>> {
        let (before_ts, before_row) = before.unzip();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE group_id = ?1
               AND (?2 IS NULL OR created_at < ?2 OR (created_at = ?2 AND rowid < ?3))
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?4"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![group_id, before_ts, before_row, limit as i64], map_message_row)?;
        self.finish_page(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    fn finish_page(&self, mut rows: Vec<MessageRecord>) -> SqlResult<Vec<MessageRecord>> {
        // Queried newest-first so LIMIT keeps the latest page
        rows.reverse();
        for msg in &mut rows {
            msg.reactions = self.reactions(&msg.id)?;
        }
        Ok(rows)
    }

    // ── Reactions ──────────────────────────────────────────────────────

    pub fn reactions(&self, message_id: &str) -> SqlResult<Vec<Reaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT reactor, emoji FROM reactions WHERE message_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(Reaction {
                reactor_id: row.get(0)?,
                emoji: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    pub fn reaction_of(&self, message_id: &str, reactor: &str) -> SqlResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT emoji FROM reactions WHERE message_id = ?1 AND reactor = ?2",
                params![message_id, reactor],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn set_reaction(&self, message_id: &str, reactor: &str, emoji: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO reactions (message_id, reactor, emoji) VALUES (?1, ?2, ?3)
             ON CONFLICT(message_id, reactor) DO UPDATE SET emoji = excluded.emoji",
            params![message_id, reactor, emoji],
        )?;
        Ok(())
    }

    pub fn remove_reaction(&self, message_id: &str, reactor: &str) -> SqlResult<()> {
        self.conn.execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND reactor = ?2",
            params![message_id, reactor],
        )?;
        Ok(())
    }
}

fn map_message_row(row: &Row<'_>) -> SqlResult<MessageRecord> {
    let recipient: Option<String> = row.get(2)?;
    let group_id: Option<String> = row.get(3)?;
    let target = match (recipient, group_id) {
        (Some(to), None) => Target::User(to),
        (None, Some(group)) => Target::Group(group),
        _ => return Err(rusqlite::Error::InvalidColumnType(2, "recipient".into(), Type::Null)),
    };
    let kind: String = row.get(4)?;
    let link_meta_json: Option<String> = row.get(9)?;
    let rank: i64 = row.get(10)?;
    let status = DeliveryStatus::from_rank(rank)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(10, rank))?;

    Ok(MessageRecord {
        id: row.get(0)?,
        from: row.get(1)?,
        target,
        msg: row.get(5)?,
        message_type: MessageKind::from_db(&kind),
        file_url: row.get(6)?,
        audio_url: row.get(7)?,
        reply_to: row.get(8)?,
        link_meta: link_meta_json.and_then(|s| serde_json::from_str(&s).ok()),
        status,
        reactions: Vec::new(),
        deleted: row.get(11)?,
        created_at: row.get(12)?,
    })
}
