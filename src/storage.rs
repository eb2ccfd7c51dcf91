//! SQLite entity cache for synchronized state.
//!
//! Holds the locally persisted copies of conversations, participants, users,
//! and assets, plus the circle-conversation projection.  The remote service is
//! the source of truth; rows here converge toward it through the job queue's
//! upsert/delete contracts.  All writes go through these methods, never raw
//! queries, and each method is a single logical write transaction.
//!
//! The connection lives behind an internal mutex, so a `Storage` can be shared
//! across worker tasks via `Arc` without external locking: concurrent readers
//! are safe and writers serialize at the store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Status and category values
// ---------------------------------------------------------------------------

/// Conversation category once known from the server.
pub const CATEGORY_GROUP: &str = "GROUP";
/// A one-to-one conversation with a single contact.
pub const CATEGORY_CONTACT: &str = "CONTACT";

/// Lifecycle of a locally cached conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    /// Created locally, not yet fetched from the server.
    Start = 0,
    /// Fully synchronized with the server.
    Success = 1,
    /// The local user no longer has access; the compensating state after a
    /// not-found/forbidden response.
    Quit = 2,
}

impl ConversationStatus {
    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ConversationStatus::Start),
            1 => Some(ConversationStatus::Success),
            2 => Some(ConversationStatus::Quit),
            _ => None,
        }
    }
}

/// Per-participant sync state: START until the server confirms the membership
/// action, then SUCCESS or ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Start = 0,
    Success = 1,
    Error = 2,
}

impl ParticipantStatus {
    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ParticipantStatus::Start),
            1 => Some(ParticipantStatus::Success),
            2 => Some(ParticipantStatus::Error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Conversation row stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub creator_id: String,
    /// "GROUP" or "CONTACT" once fetched; `None` for a placeholder.
    pub category: Option<String>,
    pub name: Option<String>,
    pub announcement: Option<String>,
    pub status: i32,
    pub created_at: u64,
}

/// Participant row; composite primary key `(conversation_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    /// "OWNER", "ADMIN", or "" for an ordinary member.
    pub role: String,
    pub status: i32,
    pub created_at: u64,
}

/// User profile row stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub identity_number: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    /// "FRIEND", "STRANGER", "ME", or "BLOCKING".
    pub relationship: String,
    pub created_at: u64,
}

/// Asset row stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRow {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub icon_url: Option<String>,
    /// Decimal string; never parsed by the sync core.
    pub balance: String,
    pub chain_id: String,
}

/// Circle membership projection row, rebuilt on every conversation upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleConversationRow {
    pub circle_id: String,
    pub conversation_id: String,
    pub created_at: u64,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database, used by tests and previews.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                creator_id      TEXT NOT NULL DEFAULT '',
                category        TEXT,
                name            TEXT,
                announcement    TEXT,
                status          INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_status
                ON conversations(status);

            CREATE TABLE IF NOT EXISTS participants (
                conversation_id TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                role            TEXT NOT NULL DEFAULT '',
                status          INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_user
                ON participants(user_id);

            CREATE TABLE IF NOT EXISTS users (
                user_id         TEXT PRIMARY KEY,
                identity_number TEXT NOT NULL DEFAULT '',
                full_name       TEXT,
                avatar_url      TEXT,
                relationship    TEXT NOT NULL DEFAULT '',
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS assets (
                asset_id    TEXT PRIMARY KEY,
                symbol      TEXT NOT NULL,
                name        TEXT NOT NULL,
                icon_url    TEXT,
                balance     TEXT NOT NULL DEFAULT '0',
                chain_id    TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS circle_conversations (
                circle_id       TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                PRIMARY KEY (circle_id, conversation_id)
            );

            CREATE INDEX IF NOT EXISTS idx_circle_conversations_conversation
                ON circle_conversations(conversation_id);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Create a START-status stub for a conversation that has not been fetched
    /// yet.  A no-op if any row already exists for the id.
    pub fn insert_placeholder(&self, conversation_id: &str) -> Result<(), StorageError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO conversations (conversation_id, status, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                conversation_id,
                ConversationStatus::Start.raw(),
                now_secs() as i64,
            ],
        )?;
        Ok(())
    }

    /// Current lifecycle status, or `None` when the conversation is unknown
    /// locally (or carries a value outside the known set, which callers treat
    /// the same way: refetch and overwrite).
    pub fn conversation_status(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationStatus>, StorageError> {
        let raw: Option<i32> = self
            .conn()
            .query_row(
                "SELECT status FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(ConversationStatus::from_raw))
    }

    pub fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRow>, StorageError> {
        let row = self
            .conn()
            .query_row(
                "SELECT conversation_id, creator_id, category, name, announcement,
                        status, created_at
                 FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                |row| {
                    Ok(ConversationRow {
                        conversation_id: row.get(0)?,
                        creator_id: row.get(1)?,
                        category: row.get(2)?,
                        name: row.get(3)?,
                        announcement: row.get(4)?,
                        status: row.get(5)?,
                        created_at: row.get::<_, i64>(6)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Replace a conversation with the server's view in one transaction:
    /// the conversation row, its full participant set, and its circle links.
    /// Safe to call twice with the same payload.
    pub fn upsert_conversation(
        &self,
        conversation: &ConversationRow,
        participants: &[ParticipantRow],
        circle_ids: &[String],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO conversations
             (conversation_id, creator_id, category, name, announcement, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.conversation_id,
                conversation.creator_id,
                conversation.category,
                conversation.name,
                conversation.announcement,
                conversation.status,
                conversation.created_at as i64,
            ],
        )?;
        tx.execute(
            "DELETE FROM participants WHERE conversation_id = ?1",
            params![conversation.conversation_id],
        )?;
        for p in participants {
            tx.execute(
                "INSERT OR REPLACE INTO participants
                 (conversation_id, user_id, role, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    p.conversation_id,
                    p.user_id,
                    p.role,
                    p.status,
                    p.created_at as i64,
                ],
            )?;
        }
        tx.execute(
            "DELETE FROM circle_conversations WHERE conversation_id = ?1",
            params![conversation.conversation_id],
        )?;
        for circle_id in circle_ids {
            tx.execute(
                "INSERT OR REPLACE INTO circle_conversations
                 (circle_id, conversation_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![circle_id, conversation.conversation_id, now_secs() as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Transition a conversation to QUIT, the compensating write after the
    /// server reports it gone or inaccessible.  Returns whether a row changed.
    pub fn mark_exited(&self, conversation_id: &str) -> Result<bool, StorageError> {
        let affected = self.conn().execute(
            "UPDATE conversations SET status = ?1 WHERE conversation_id = ?2",
            params![ConversationStatus::Quit.raw(), conversation_id],
        )?;
        Ok(affected > 0)
    }

    /// Remove a conversation and its dependent rows, used when a contact is
    /// fully severed.  Returns whether the conversation existed.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM participants WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.execute(
            "DELETE FROM circle_conversations WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let affected = tx.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Participants
    // -----------------------------------------------------------------------

    pub fn participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ParticipantRow>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, user_id, role, status, created_at
             FROM participants WHERE conversation_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(ParticipantRow {
                conversation_id: row.get(0)?,
                user_id: row.get(1)?,
                role: row.get(2)?,
                status: row.get(3)?,
                created_at: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn update_participant_status(
        &self,
        conversation_id: &str,
        user_id: &str,
        status: ParticipantStatus,
    ) -> Result<bool, StorageError> {
        let affected = self.conn().execute(
            "UPDATE participants SET status = ?1
             WHERE conversation_id = ?2 AND user_id = ?3",
            params![status.raw(), conversation_id, user_id],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<bool, StorageError> {
        let affected = self.conn().execute(
            "DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
        )?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub fn upsert_user(&self, row: &UserRow) -> Result<(), StorageError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO users
             (user_id, identity_number, full_name, avatar_url, relationship, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.user_id,
                row.identity_number,
                row.full_name,
                row.avatar_url,
                row.relationship,
                row.created_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>, StorageError> {
        let row = self
            .conn()
            .query_row(
                "SELECT user_id, identity_number, full_name, avatar_url, relationship, created_at
                 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserRow {
                        user_id: row.get(0)?,
                        identity_number: row.get(1)?,
                        full_name: row.get(2)?,
                        avatar_url: row.get(3)?,
                        relationship: row.get(4)?,
                        created_at: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Assets
    // -----------------------------------------------------------------------

    pub fn upsert_asset(&self, row: &AssetRow) -> Result<(), StorageError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO assets
             (asset_id, symbol, name, icon_url, balance, chain_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.asset_id,
                row.symbol,
                row.name,
                row.icon_url,
                row.balance,
                row.chain_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_asset(&self, asset_id: &str) -> Result<Option<AssetRow>, StorageError> {
        let row = self
            .conn()
            .query_row(
                "SELECT asset_id, symbol, name, icon_url, balance, chain_id
                 FROM assets WHERE asset_id = ?1",
                params![asset_id],
                |row| {
                    Ok(AssetRow {
                        asset_id: row.get(0)?,
                        symbol: row.get(1)?,
                        name: row.get(2)?,
                        icon_url: row.get(3)?,
                        balance: row.get(4)?,
                        chain_id: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Circle projection
    // -----------------------------------------------------------------------

    /// Circles the conversation currently belongs to.
    pub fn circle_conversation_ids(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT circle_id FROM circle_conversations
             WHERE conversation_id = ?1 ORDER BY circle_id",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_row(conversation_id: &str) -> ConversationRow {
        ConversationRow {
            conversation_id: conversation_id.to_string(),
            creator_id: "creator".to_string(),
            category: Some(CATEGORY_GROUP.to_string()),
            name: Some("Rust study group".to_string()),
            announcement: None,
            status: ConversationStatus::Success.raw(),
            created_at: 1_754_000_000,
        }
    }

    fn member(conversation_id: &str, user_id: &str, role: &str) -> ParticipantRow {
        ParticipantRow {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            role: role.to_string(),
            status: ParticipantStatus::Success.raw(),
            created_at: 1_754_000_000,
        }
    }

    #[test]
    fn placeholder_starts_at_start_status() {
        let storage = Storage::open_in_memory().unwrap();

        assert!(storage.conversation_status("conv-1").unwrap().is_none());
        storage.insert_placeholder("conv-1").unwrap();
        assert_eq!(
            storage.conversation_status("conv-1").unwrap(),
            Some(ConversationStatus::Start)
        );

        // A second placeholder insert must not reset an upserted row.
        storage
            .upsert_conversation(&group_row("conv-1"), &[], &[])
            .unwrap();
        storage.insert_placeholder("conv-1").unwrap();
        assert_eq!(
            storage.conversation_status("conv-1").unwrap(),
            Some(ConversationStatus::Success)
        );
    }

    #[test]
    fn upsert_conversation_replaces_participants_and_circles() {
        let storage = Storage::open_in_memory().unwrap();
        let row = group_row("conv-1");

        storage
            .upsert_conversation(
                &row,
                &[
                    member("conv-1", "alice", "OWNER"),
                    member("conv-1", "bob", ""),
                ],
                &["circle-a".to_string()],
            )
            .unwrap();

        // Re-apply with a different membership: old rows must be gone.
        storage
            .upsert_conversation(
                &row,
                &[member("conv-1", "alice", "OWNER")],
                &["circle-b".to_string()],
            )
            .unwrap();

        let participants = storage.participants("conv-1").unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].user_id, "alice");
        assert_eq!(participants[0].role, "OWNER");
        assert_eq!(
            storage.circle_conversation_ids("conv-1").unwrap(),
            vec!["circle-b".to_string()]
        );
    }

    #[test]
    fn upsert_conversation_is_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        let row = group_row("conv-1");
        let members = [
            member("conv-1", "alice", "OWNER"),
            member("conv-1", "bob", ""),
        ];
        let circles = ["circle-a".to_string()];

        storage
            .upsert_conversation(&row, &members, &circles)
            .unwrap();
        let first = (
            storage.get_conversation("conv-1").unwrap(),
            storage.participants("conv-1").unwrap(),
            storage.circle_conversation_ids("conv-1").unwrap(),
        );

        storage
            .upsert_conversation(&row, &members, &circles)
            .unwrap();
        let second = (
            storage.get_conversation("conv-1").unwrap(),
            storage.participants("conv-1").unwrap(),
            storage.circle_conversation_ids("conv-1").unwrap(),
        );

        assert_eq!(first, second);
        assert_eq!(second.1.len(), 2);
    }

    #[test]
    fn mark_exited_transitions_to_quit() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .upsert_conversation(&group_row("conv-1"), &[], &[])
            .unwrap();

        assert!(storage.mark_exited("conv-1").unwrap());
        assert_eq!(
            storage.conversation_status("conv-1").unwrap(),
            Some(ConversationStatus::Quit)
        );

        // Unknown conversation: nothing to do.
        assert!(!storage.mark_exited("conv-404").unwrap());
    }

    #[test]
    fn delete_conversation_removes_dependent_rows() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .upsert_conversation(
                &group_row("conv-1"),
                &[member("conv-1", "alice", "OWNER")],
                &["circle-a".to_string()],
            )
            .unwrap();

        assert!(storage.delete_conversation("conv-1").unwrap());
        assert!(storage.get_conversation("conv-1").unwrap().is_none());
        assert!(storage.participants("conv-1").unwrap().is_empty());
        assert!(storage.circle_conversation_ids("conv-1").unwrap().is_empty());
        assert!(!storage.delete_conversation("conv-1").unwrap());
    }

    #[test]
    fn participant_status_machine() {
        let storage = Storage::open_in_memory().unwrap();
        let mut pending = member("conv-1", "carol", "");
        pending.status = ParticipantStatus::Start.raw();
        storage
            .upsert_conversation(&group_row("conv-1"), &[pending], &[])
            .unwrap();

        assert!(storage
            .update_participant_status("conv-1", "carol", ParticipantStatus::Error)
            .unwrap());
        let rows = storage.participants("conv-1").unwrap();
        assert_eq!(
            ParticipantStatus::from_raw(rows[0].status),
            Some(ParticipantStatus::Error)
        );

        assert!(storage.remove_participant("conv-1", "carol").unwrap());
        assert!(storage.participants("conv-1").unwrap().is_empty());
        assert!(!storage.remove_participant("conv-1", "carol").unwrap());
    }

    #[test]
    fn user_upsert_and_get() {
        let storage = Storage::open_in_memory().unwrap();
        let mut row = UserRow {
            user_id: "u-1".to_string(),
            identity_number: "31007".to_string(),
            full_name: Some("Alice".to_string()),
            avatar_url: None,
            relationship: "FRIEND".to_string(),
            created_at: 1_754_000_000,
        };

        storage.upsert_user(&row).unwrap();
        assert_eq!(storage.get_user("u-1").unwrap().unwrap(), row);

        // Replacement keeps the same primary key.
        row.full_name = Some("Alice B".to_string());
        storage.upsert_user(&row).unwrap();
        assert_eq!(
            storage.get_user("u-1").unwrap().unwrap().full_name,
            Some("Alice B".to_string())
        );
    }

    #[test]
    fn asset_upsert_and_get() {
        let storage = Storage::open_in_memory().unwrap();
        let row = AssetRow {
            asset_id: "btc".to_string(),
            symbol: "BTC".to_string(),
            name: "Bitcoin".to_string(),
            icon_url: None,
            balance: "0.5".to_string(),
            chain_id: "chain-btc".to_string(),
        };

        storage.upsert_asset(&row).unwrap();
        storage.upsert_asset(&row).unwrap();
        assert_eq!(storage.get_asset("btc").unwrap().unwrap(), row);
        assert!(storage.get_asset("eth").unwrap().is_none());
    }
}
