//! Browser sessions and consumed assertion IDs, persisted in redb.
//!
//! Sessions are keyed by the hex of their opaque token and mirrored in a
//! bounded in-memory cache. Consumed assertion IDs live in a second table
//! until the assertion itself would have expired.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{Session, SessionToken};
use crate::saml::AssertionClaims;

/// token hex -> MessagePack<Session>.
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// assertion ID -> MessagePack<DateTime<Utc>> (when the record may be dropped).
const ASSERTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("consumed_assertions");

const MAX_CACHED_SESSIONS: usize = 10_000;

pub struct SessionStore {
    db: Database,
    cache: RwLock<HashMap<SessionToken, Session>>,
    ttl_secs: u64,
    max_cache_size: usize,
}

impl SessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: PathBuf, ttl_secs: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(ASSERTIONS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_sessions(&db)?;
        debug!(sessions = cache.len(), "Loaded active sessions into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            ttl_secs,
            max_cache_size: MAX_CACHED_SESSIONS,
        })
    }

    /// Create a session for freshly validated claims.
    pub fn create(&self, claims: AssertionClaims) -> Result<Session> {
        let session = Session::new(claims, self.ttl_secs);
        self.persist(&session)?;

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_cache_size {
                self.evict_cache_lru(&mut cache);
            }
            cache.insert(session.token, session.clone());
        }

        debug!(name_id = %session.name_id(), expires_at = %session.expires_at, "Session created");
        Ok(session)
    }

    /// Look up a live session, updating last_accessed time.
    ///
    /// Unknown and expired tokens yield `Ok(None)`.
    pub fn lookup(&self, token: SessionToken) -> Result<Option<Session>> {
        if let Ok(mut cache) = self.cache.write() {
            if let Some(session) = cache.get_mut(&token) {
                if session.is_expired() {
                    cache.remove(&token);
                    // Cleanup task removes the row.
                    return Ok(None);
                }
                session.touch();
                return Ok(Some(session.clone()));
            }
        }

        let stored = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;
            let key = token.to_hex();
            let value = table.get(key.as_str())?;
            let decoded = match value {
                Some(value) => Some(
                    rmp_serde::from_slice::<Session>(value.value())
                        .context("Failed to deserialize session")?,
                ),
                None => None,
            };
            decoded
        };
        let Some(mut session) = stored else {
            return Ok(None);
        };

        if session.is_expired() {
            return Ok(None);
        }
        session.touch();

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_cache_size {
                self.evict_cache_lru(&mut cache);
            }
            cache.insert(token, session.clone());
        }

        Ok(Some(session))
    }

    /// Remove a session. Revoking an unknown token is not an error.
    pub fn revoke(&self, token: SessionToken) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&token);
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let result = table.remove(token.to_hex().as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        Ok(removed)
    }

    /// Remove every session of a subject (IdP-initiated logout).
    ///
    /// With `session_indexes` non-empty, only sessions whose SessionIndex is
    /// listed are removed.
    pub fn revoke_by_name_id(&self, name_id: &str, session_indexes: &[String]) -> Result<usize> {
        let matches = |session: &Session| {
            session.claims.name_id == name_id
                && (session_indexes.is_empty()
                    || session
                        .claims
                        .session_index
                        .as_ref()
                        .is_some_and(|i| session_indexes.contains(i)))
        };

        let tokens: Vec<SessionToken> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut tokens = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                match rmp_serde::from_slice::<Session>(value.value()) {
                    Ok(session) if matches(&session) => tokens.push(session.token),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Skipping undecodable session"),
                }
            }
            tokens
        };

        let mut revoked = 0;
        for token in tokens {
            if self.revoke(token)? {
                revoked += 1;
            }
        }

        debug!(name_id = %name_id, revoked, "Revoked sessions for subject");
        Ok(revoked)
    }

    /// Record an assertion ID as consumed until `expires_at`.
    ///
    /// Check and insert share one write transaction, so of two concurrent
    /// callers with the same ID exactly one gets `true`.
    pub fn mark_assertion_used(&self, assertion_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let data = rmp_serde::to_vec(&expires_at)?;
        let write_txn = self.db.begin_write()?;
        let fresh = {
            let mut table = write_txn.open_table(ASSERTIONS_TABLE)?;
            let seen = table.get(assertion_id)?.is_some();
            if !seen {
                table.insert(assertion_id, data.as_slice())?;
            }
            !seen
        };
        write_txn.commit()?;
        Ok(fresh)
    }

    /// Evict all expired sessions and assertion records.
    /// Returns the number of sessions evicted.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();

        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, session| !session.is_expired());
        }

        let expired_sessions: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<Session>(value.value()) {
                    Ok(session) if session.is_expired() => {
                        keys.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to deserialize session, marking for deletion");
                        keys.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            keys
        };

        let expired_assertions: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(ASSERTIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<DateTime<Utc>>(value.value()) {
                    Ok(expires_at) if now > expires_at => ids.push(key.value().to_string()),
                    Err(_) => ids.push(key.value().to_string()),
                    _ => {}
                }
            }
            ids
        };

        let mut evicted = 0;
        let write_txn = self.db.begin_write()?;
        {
            let mut sessions = write_txn.open_table(SESSIONS_TABLE)?;
            for key in &expired_sessions {
                if sessions.remove(key.as_str())?.is_some() {
                    evicted += 1;
                }
            }
            let mut assertions = write_txn.open_table(ASSERTIONS_TABLE)?;
            for id in &expired_assertions {
                assertions.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;

        Ok(evicted)
    }

    /// Number of stored sessions, expired ones included until evicted.
    pub fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let data = rmp_serde::to_vec(session).context("Failed to serialize session")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(session.token.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load all non-expired sessions into cache.
    fn load_active_sessions(db: &Database) -> Result<HashMap<SessionToken, Session>> {
        let mut sessions = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        for entry in table.iter()? {
            let (_, value) = entry?;
            match rmp_serde::from_slice::<Session>(value.value()) {
                Ok(session) if !session.is_expired() => {
                    sessions.insert(session.token, session);
                }
                _ => {}
            }
        }

        Ok(sessions)
    }

    /// Drop the least recently used cached session.
    fn evict_cache_lru(&self, cache: &mut HashMap<SessionToken, Session>) {
        if let Some(oldest) = cache
            .iter()
            .min_by_key(|(_, s)| s.last_accessed)
            .map(|(token, _)| *token)
        {
            cache.remove(&oldest);
        }
    }
}
