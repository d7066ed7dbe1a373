//! # Identity Key Storage
//!
//! The only state Parley persists is the local identity. It goes through
//! the [`KeyStore`] trait so the encryption service does not care whether
//! it sits in a sled database on disk or in a `HashMap` inside a test.
//!
//! ## Record format
//!
//! One bincode-encoded [`StoredIdentity`] per storage key:
//!
//! | Tree       | Key                 | Value                     |
//! |------------|---------------------|---------------------------|
//! | `identity` | storage key (UTF-8) | `bincode(StoredIdentity)` |
//!
//! The record is versioned so a future key type can coexist with old
//! records instead of silently misreading them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;

use super::keys::IdentityKeypair;
use crate::config::X25519_KEY_LENGTH;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors raised by key store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unsupported identity record version {0}")]
    UnsupportedVersion(u8),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Byte-oriented persistence for identity records.
pub trait KeyStore: Send + Sync {
    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn save(&self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

const RECORD_VERSION: u8 = 1;

/// Persisted form of the local identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub version: u8,
    pub secret_key: [u8; X25519_KEY_LENGTH],
    pub created_at: DateTime<Utc>,
}

impl StoredIdentity {
    pub fn from_keypair(keypair: &IdentityKeypair) -> Self {
        Self {
            version: RECORD_VERSION,
            secret_key: keypair.secret_bytes(),
            created_at: Utc::now(),
        }
    }

    pub fn to_keypair(&self) -> IdentityKeypair {
        IdentityKeypair::from_secret_bytes(self.secret_key)
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let record: Self =
            bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if record.version != RECORD_VERSION {
            return Err(StoreError::UnsupportedVersion(record.version));
        }
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// SledKeyStore
// ---------------------------------------------------------------------------

/// sled-backed store. One `identity` tree, flushed on every write.
#[derive(Debug, Clone)]
pub struct SledKeyStore {
    db: Db,
    identity: Tree,
}

impl SledKeyStore {
    /// Open or create a store at `path`.
    ///
    /// Every write is flushed inline, so the background flusher is off and
    /// dropping the last handle releases the database lock immediately.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(None)
            .open()?;
        Self::from_db(db)
    }

    /// In-memory sled database, removed on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let identity = db.open_tree("identity")?;
        Ok(Self { db, identity })
    }
}

impl KeyStore for SledKeyStore {
    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.identity.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn save(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.identity.insert(key.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.identity.remove(key.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryKeyStore
// ---------------------------------------------------------------------------

/// Volatile store for tests and throwaway nodes.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
