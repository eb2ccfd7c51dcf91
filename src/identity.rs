//! Durable store for cryptographic identities, keyed by address.
//!
//! One row per peer, plus exactly one local row pinned at address `"-1"`.
//! The local row always carries its private key; remote rows never do.  The
//! messaging protocol layer reads identities from here; the sync core only
//! persists them.
//!
//! Identities live in their own SQLite database, separate from the entity
//! cache, so wiping or rotating key material never touches synchronized
//! state.  The store serializes its own writes; callers share it via `Arc`
//! with no external locking.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rand::rngs::OsRng;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use crate::storage::now_secs;

/// Address of the single local identity row.
pub const LOCAL_ADDRESS: &str = "-1";

/// Registration ids are 14-bit, per the provisioning handshake.
const MAX_REGISTRATION_ID: u32 = 16380;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum IdentityError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// The local address `"-1"` cannot be written through the remote-identity
    /// path.
    ReservedAddress(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            IdentityError::Io(e) => write!(f, "io error: {e}"),
            IdentityError::ReservedAddress(address) => {
                write!(f, "address is reserved for the local identity: {address}")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

impl From<rusqlite::Error> for IdentityError {
    fn from(e: rusqlite::Error) -> Self {
        IdentityError::Sqlite(e)
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(e: std::io::Error) -> Self {
        IdentityError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

/// Identity row stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRow {
    pub address: String,
    pub registration_id: u32,
    pub public_key: Vec<u8>,
    /// Present only on the local row.
    pub private_key: Option<Vec<u8>>,
    pub next_pre_key_id: Option<u32>,
    pub timestamp: u64,
}

impl IdentityRow {
    /// Short hex form of the public key, for log lines.
    pub fn fingerprint(&self) -> String {
        let head = &self.public_key[..self.public_key.len().min(4)];
        hex::encode(head)
    }
}

/// Generate a fresh 14-bit registration id for account provisioning.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=MAX_REGISTRATION_ID)
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Identity store handle wrapping its own SQLite connection.
pub struct IdentityStore {
    conn: Mutex<Connection>,
}

impl IdentityStore {
    /// Open or create the identity database at the given path.
    pub fn open(path: &Path) -> Result<Self, IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// Create an in-memory identity database, used by tests.
    pub fn open_in_memory() -> Result<Self, IdentityError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn create_schema(&self) -> Result<(), IdentityError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS identities (
                address         TEXT PRIMARY KEY,
                registration_id INTEGER NOT NULL,
                public_key      BLOB NOT NULL,
                private_key     BLOB,
                next_pre_key_id INTEGER,
                timestamp       INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Insert or replace the local identity at address `"-1"`.  Idempotent:
    /// saving the same material twice yields the same stored row.
    pub fn save_local_identity(
        &self,
        registration_id: u32,
        public_key: &[u8],
        private_key: &[u8],
    ) -> Result<(), IdentityError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO identities
             (address, registration_id, public_key, private_key, next_pre_key_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![
                LOCAL_ADDRESS,
                registration_id,
                public_key,
                private_key,
                now_secs() as i64,
            ],
        )?;
        Ok(())
    }

    /// The local identity, or `None` before registration has happened.
    pub fn get_local_identity(&self) -> Result<Option<IdentityRow>, IdentityError> {
        self.get_identity(LOCAL_ADDRESS)
    }

    /// Insert or replace a remote peer's identity.  Never stores a private
    /// key, and refuses the reserved local address.
    pub fn save_remote_identity(
        &self,
        address: &str,
        registration_id: u32,
        public_key: &[u8],
    ) -> Result<(), IdentityError> {
        if address == LOCAL_ADDRESS {
            return Err(IdentityError::ReservedAddress(address.to_string()));
        }
        self.conn().execute(
            "INSERT OR REPLACE INTO identities
             (address, registration_id, public_key, private_key, next_pre_key_id, timestamp)
             VALUES (?1, ?2, ?3, NULL, NULL, ?4)",
            params![address, registration_id, public_key, now_secs() as i64],
        )?;
        Ok(())
    }

    pub fn get_identity(&self, address: &str) -> Result<Option<IdentityRow>, IdentityError> {
        let row = self
            .conn()
            .query_row(
                "SELECT address, registration_id, public_key, private_key,
                        next_pre_key_id, timestamp
                 FROM identities WHERE address = ?1",
                params![address],
                |row| {
                    Ok(IdentityRow {
                        address: row.get(0)?,
                        registration_id: row.get(1)?,
                        public_key: row.get(2)?,
                        private_key: row.get(3)?,
                        next_pre_key_id: row.get(4)?,
                        timestamp: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Remove a peer's stored identity, used when a contact is fully severed.
    /// A guarded no-op for the local address; returns whether a row was
    /// removed.
    pub fn delete_identity(&self, address: &str) -> Result<bool, IdentityError> {
        if address == LOCAL_ADDRESS {
            return Ok(false);
        }
        let affected = self
            .conn()
            .execute("DELETE FROM identities WHERE address = ?1", params![address])?;
        Ok(affected > 0)
    }

    /// Number of stored identities, local row included.  Callers use this to
    /// decide whether key material needs (re)generation.
    pub fn count(&self) -> Result<u64, IdentityError> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_identity_roundtrip() {
        let store = IdentityStore::open_in_memory().unwrap();
        assert!(store.get_local_identity().unwrap().is_none());

        store
            .save_local_identity(512, b"public-material", b"private-material")
            .unwrap();
        // Idempotent: same material again.
        store
            .save_local_identity(512, b"public-material", b"private-material")
            .unwrap();

        let row = store.get_local_identity().unwrap().unwrap();
        assert_eq!(row.address, LOCAL_ADDRESS);
        assert_eq!(row.registration_id, 512);
        assert_eq!(row.private_key.as_deref(), Some(&b"private-material"[..]));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn key_rotation_replaces_the_single_local_row() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.save_local_identity(1, b"pub-1", b"priv-1").unwrap();
        store.save_local_identity(2, b"pub-2", b"priv-2").unwrap();

        let row = store.get_local_identity().unwrap().unwrap();
        assert_eq!(row.registration_id, 2);
        assert_eq!(row.public_key, b"pub-2");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn remote_identities_never_carry_private_keys() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .save_remote_identity("peer-address", 77, b"peer-public")
            .unwrap();

        let row = store.get_identity("peer-address").unwrap().unwrap();
        assert_eq!(row.registration_id, 77);
        assert!(row.private_key.is_none());
    }

    #[test]
    fn remote_save_rejects_the_local_address() {
        let store = IdentityStore::open_in_memory().unwrap();
        let err = store
            .save_remote_identity(LOCAL_ADDRESS, 3, b"spoofed")
            .unwrap_err();
        assert!(matches!(err, IdentityError::ReservedAddress(_)));
    }

    #[test]
    fn delete_is_guarded_for_the_local_row() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.save_local_identity(1, b"pub", b"priv").unwrap();
        store.save_remote_identity("peer", 2, b"peer-pub").unwrap();
        assert_eq!(store.count().unwrap(), 2);

        assert!(!store.delete_identity(LOCAL_ADDRESS).unwrap());
        assert!(store.get_local_identity().unwrap().is_some());

        assert!(store.delete_identity("peer").unwrap());
        assert!(!store.delete_identity("peer").unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn registration_ids_stay_in_range() {
        for _ in 0..64 {
            let id = generate_registration_id();
            assert!((1..=MAX_REGISTRATION_ID).contains(&id));
        }
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let row = IdentityRow {
            address: "peer".to_string(),
            registration_id: 1,
            public_key: vec![0xde, 0xad, 0xbe, 0xef, 0x01],
            private_key: None,
            next_pre_key_id: None,
            timestamp: 0,
        };
        assert_eq!(row.fingerprint(), "deadbeef");
    }
}
