//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Avatar image blobs (content-addressed, keyed by hash hex)
//! - The identity → avatar-hash index, so it survives restarts
//!
//! `Storage` is the production implementation of the [`PersistentStore`]
//! seam consumed by the content-addressable avatar store. All I/O here is
//! local; nothing in this module touches the network.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{AvatarError, AvatarResult};
use crate::store::PersistentStore;
use crate::types::{AvatarHash, IdentityId};

/// Table for avatar image blobs (key: BLAKE3 hash hex string, value: raw bytes)
const AVATARS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("avatars");

/// Table for the identity → hash index (key: bare address, value: postcard AvatarHash)
const AVATAR_INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("avatar_index");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> AvatarResult<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        // Initialize all tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(AVATARS_TABLE)?;
            let _ = write_txn.open_table(AVATAR_INDEX_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Index Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist an identity's current avatar hash.
    ///
    /// Overwrites any previous entry for the identity.
    pub fn write_index_entry(
        &self,
        identity: &IdentityId,
        hash: &AvatarHash,
    ) -> AvatarResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(AVATAR_INDEX_TABLE)?;
            let value = postcard::to_allocvec(hash)
                .map_err(|e| AvatarError::Serialization(e.to_string()))?;
            table.insert(identity.as_str(), value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove an identity's index entry.
    ///
    /// Returns `Ok(())` even if no entry exists.
    pub fn remove_index_entry(&self, identity: &IdentityId) -> AvatarResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(AVATAR_INDEX_TABLE)?;
            table.remove(identity.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the full identity → hash index for startup restore.
    pub fn load_index(&self) -> AvatarResult<Vec<(IdentityId, AvatarHash)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(AVATAR_INDEX_TABLE)?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let hash: AvatarHash = postcard::from_bytes(value.value())
                .map_err(|e| AvatarError::Serialization(e.to_string()))?;
            entries.push((IdentityId::new(key.value()), hash));
        }
        Ok(entries)
    }
}

impl PersistentStore for Storage {
    fn write(&self, hash: &AvatarHash, data: &[u8]) -> AvatarResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(AVATARS_TABLE)?;
            table.insert(hash.as_str(), data)?;
        }
        write_txn.commit()?;
        debug!(%hash, len = data.len(), "Persisted avatar blob");
        Ok(())
    }

    fn read(&self, hash: &AvatarHash) -> AvatarResult<Option<Bytes>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(AVATARS_TABLE)?;

        Ok(table
            .get(hash.as_str())?
            .map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn delete(&self, hash: &AvatarHash) -> AvatarResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(AVATARS_TABLE)?;
            table.remove(hash.as_str())?;
        }
        write_txn.commit()?;
        debug!(%hash, "Deleted avatar blob");
        Ok(())
    }
}
