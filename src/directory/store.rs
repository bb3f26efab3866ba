//! User and star store backed by redb embedded database.
//!
//! Users are cached in memory; stars are read from disk on demand.

use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info};

use super::types::{Star, StarError, User};
use super::UserProvisioner;

/// Primary user table: email -> MessagePack<User>.
const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
/// Star table: star id -> MessagePack<Star>.
const STARS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("stars");

pub struct DirectoryStore {
    db: Database,
    /// email -> User.
    user_cache: RwLock<HashMap<String, User>>,
}

impl DirectoryStore {
    /// Open or create a directory store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open directory database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS_TABLE)?;
            let _ = write_txn.open_table(STARS_TABLE)?;
        }
        write_txn.commit()?;

        let user_cache = Self::load_users(&db)?;
        debug!(users = user_cache.len(), "Loaded users into cache");

        Ok(Self {
            db,
            user_cache: RwLock::new(user_cache),
        })
    }

    /// Insert or refresh a user. The display name follows the latest login.
    pub fn upsert_user(&self, email: &str, display_name: &str) -> Result<User> {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let user = {
            let mut table = write_txn.open_table(USERS_TABLE)?;
            let existing = match table.get(email)? {
                Some(value) => Some(
                    rmp_serde::from_slice::<User>(value.value())
                        .context("Failed to deserialize user")?,
                ),
                None => None,
            };

            let user = match existing {
                Some(mut user) => {
                    user.display_name = display_name.to_string();
                    user.updated_at = now;
                    user
                }
                None => {
                    info!(email = %email, "Provisioning new user");
                    User {
                        email: email.to_string(),
                        display_name: display_name.to_string(),
                        created_at: now,
                        updated_at: now,
                    }
                }
            };

            let data = rmp_serde::to_vec_named(&user).context("Failed to serialize user")?;
            table.insert(email, data.as_slice())?;
            user
        };
        write_txn.commit()?;

        if let Ok(mut cache) = self.user_cache.write() {
            cache.insert(user.email.clone(), user.clone());
        }
        Ok(user)
    }

    pub fn get_user(&self, email: &str) -> Result<Option<User>> {
        if let Ok(cache) = self.user_cache.read() {
            if let Some(user) = cache.get(email) {
                return Ok(Some(user.clone()));
            }
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;
        let value = table.get(email)?;
        match value {
            Some(value) => {
                let user: User = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize user")?;
                if let Ok(mut cache) = self.user_cache.write() {
                    cache.insert(user.email.clone(), user.clone());
                }
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Everyone except `email`, ordered by display name.
    pub fn list_colleagues(&self, email: &str) -> Result<Vec<User>> {
        let cache = self
            .user_cache
            .read()
            .map_err(|_| anyhow::anyhow!("Lock poisoned"))?;
        let mut users: Vec<User> = cache
            .values()
            .filter(|u| u.email != email)
            .cloned()
            .collect();
        users.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.email.cmp(&b.email))
        });
        Ok(users)
    }

    /// Record a star. Both users must exist and be different people.
    pub fn give_star(&self, giver_email: &str, receiver_email: &str) -> Result<Star, StarError> {
        if giver_email == receiver_email {
            return Err(StarError::SelfStar);
        }
        if self.get_user(receiver_email)?.is_none() {
            return Err(StarError::UnknownReceiver(receiver_email.to_string()));
        }

        let star = Star::new(giver_email, receiver_email);
        let data = rmp_serde::to_vec_named(&star)
            .context("Failed to serialize star")
            .map_err(StarError::Storage)?;
        let write = || -> Result<()> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(STARS_TABLE)?;
                table.insert(star.id.as_str(), data.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        };
        write()?;

        debug!(giver = %giver_email, receiver = %receiver_email, "Star recorded");
        Ok(star)
    }

    /// Stars received by `email`, newest first.
    pub fn stars_received(&self, email: &str) -> Result<Vec<Star>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STARS_TABLE)?;

        let mut stars = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let star: Star =
                rmp_serde::from_slice(value.value()).context("Failed to deserialize star")?;
            if star.receiver_email == email {
                stars.push(star);
            }
        }
        stars.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(stars)
    }

    fn load_users(db: &Database) -> Result<HashMap<String, User>> {
        let mut users = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let user: User =
                rmp_serde::from_slice(value.value()).context("Failed to deserialize user")?;
            users.insert(user.email.clone(), user);
        }
        Ok(users)
    }
}

impl UserProvisioner for DirectoryStore {
    fn upsert(&self, email: &str, display_name: &str) -> Result<User> {
        self.upsert_user(email, display_name)
    }
}
