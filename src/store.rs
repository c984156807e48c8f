use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info, warn};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, MySqlPool, mysql::MySqlPoolOptions};

use crate::{config::StoreConfig, credentials::Credentials, error::StoreError};

/// One student's scraped data as persisted. `curriculum` and `achievement`
/// hold JSON text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StudentRecord {
    pub hash_id: String,
    pub hash_username: String,
    pub school: String,
    pub name: String,
    pub curriculum: String,
    pub achievement: String,
    pub other: String,
}

impl StudentRecord {
    pub fn new(
        credentials: &Credentials,
        name: impl Into<String>,
        curriculum: impl Into<String>,
        achievement: impl Into<String>,
    ) -> Self {
        Self {
            hash_id: credentials.hash_id(),
            hash_username: credentials.hash_username(),
            school: credentials.school.clone(),
            name: name.into(),
            curriculum: curriculum.into(),
            achievement: achievement.into(),
            other: String::new(),
        }
    }

    fn fields(&self) -> [(&'static str, &str); 7] {
        [
            ("hash_id", self.hash_id.as_str()),
            ("hash_username", self.hash_username.as_str()),
            ("school", self.school.as_str()),
            ("name", self.name.as_str()),
            ("curriculum", self.curriculum.as_str()),
            ("achievement", self.achievement.as_str()),
            ("other", self.other.as_str()),
        ]
    }

    fn from_fields(mut map: HashMap<String, String>) -> Self {
        let mut take = |key: &str| map.remove(key).unwrap_or_default();
        Self {
            hash_id: take("hash_id"),
            hash_username: take("hash_username"),
            school: take("school"),
            name: take("name"),
            curriculum: take("curriculum"),
            achievement: take("achievement"),
            other: take("other"),
        }
    }

    fn has_data(&self) -> bool {
        !self.curriculum.is_empty() && !self.achievement.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Found(StudentRecord),
    NotFound,
    /// The account exists but was stored under a different password.
    CredentialMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Short-lived copy of records keyed by `hash_id`.
#[async_trait]
pub trait RecordCache: Send + Sync {
    async fn get(&self, hash_id: &str) -> Result<Option<StudentRecord>, StoreError>;
    async fn put(&self, record: &StudentRecord) -> Result<(), StoreError>;
}

/// Durable storage keyed by `hash_username`.
#[async_trait]
pub trait RecordDatabase: Send + Sync {
    async fn find_by_username(
        &self,
        hash_username: &str,
    ) -> Result<Option<StudentRecord>, StoreError>;
    async fn insert(&self, record: &StudentRecord) -> Result<(), StoreError>;
    async fn update(&self, record: &StudentRecord) -> Result<(), StoreError>;
}

pub struct RedisCache {
    client: redis::Client,
    ttl_secs: i64,
}

impl RedisCache {
    pub fn new(url: &str, ttl_secs: i64) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client, ttl_secs })
    }
}

#[async_trait]
impl RecordCache for RedisCache {
    async fn get(&self, hash_id: &str) -> Result<Option<StudentRecord>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let map: HashMap<String, String> = conn.hgetall(hash_id).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(StudentRecord::from_fields(map)))
    }

    async fn put(&self, record: &StudentRecord) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.hset_multiple(&record.hash_id, &record.fields()).await?;
        let _: bool = conn.expire(&record.hash_id, self.ttl_secs).await?;
        debug!("Cached record {} for {}s", record.hash_id, self.ttl_secs);
        Ok(())
    }
}

pub struct MySqlDatabase {
    pool: MySqlPool,
}

impl MySqlDatabase {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the `user` table if it isn't there yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS `user` (
                hash_id VARCHAR(64) NOT NULL,
                hash_username VARCHAR(64) NOT NULL PRIMARY KEY,
                school VARCHAR(16) NOT NULL DEFAULT '',
                name VARCHAR(32) NOT NULL DEFAULT '',
                curriculum MEDIUMTEXT NOT NULL,
                achievement MEDIUMTEXT NOT NULL,
                other TEXT NOT NULL
            ) DEFAULT CHARSET = utf8mb4"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordDatabase for MySqlDatabase {
    async fn find_by_username(
        &self,
        hash_username: &str,
    ) -> Result<Option<StudentRecord>, StoreError> {
        let record = sqlx::query_as::<_, StudentRecord>(
            "SELECT hash_id, hash_username, school, name, curriculum, achievement, other \
             FROM `user` WHERE hash_username = ?",
        )
        .bind(hash_username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn insert(&self, record: &StudentRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO `user` (hash_id, hash_username, school, name, curriculum, achievement, other) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.hash_id)
        .bind(&record.hash_username)
        .bind(&record.school)
        .bind(&record.name)
        .bind(&record.curriculum)
        .bind(&record.achievement)
        .bind(&record.other)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, record: &StudentRecord) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE `user` SET hash_id = ?, school = ?, name = ?, curriculum = ?, achievement = ?, other = ? \
             WHERE hash_username = ?",
        )
        .bind(&record.hash_id)
        .bind(&record.school)
        .bind(&record.name)
        .bind(&record.curriculum)
        .bind(&record.achievement)
        .bind(&record.other)
        .bind(&record.hash_username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Cache-aside lookup over a database of student records.
pub struct RecordStore<C, D> {
    cache: C,
    database: D,
}

impl RecordStore<RedisCache, MySqlDatabase> {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let cache = RedisCache::new(&config.redis_url, config.redis_ttl_secs)?;
        let database = MySqlDatabase::connect(&config.database_url).await?;
        database.migrate().await?;
        Ok(Self::new(cache, database))
    }
}

impl<C: RecordCache, D: RecordDatabase> RecordStore<C, D> {
    pub fn new(cache: C, database: D) -> Self {
        Self { cache, database }
    }

    async fn cache_quietly(&self, record: &StudentRecord) {
        if let Err(e) = self.cache.put(record).await {
            warn!("Could not cache record {}: {e}", record.hash_id);
        }
    }

    pub async fn search(&self, record: &StudentRecord) -> Result<SearchOutcome, StoreError> {
        match self.cache.get(&record.hash_id).await {
            Ok(Some(cached)) if cached.has_data() => {
                debug!("Cache hit for {}", record.hash_id);
                return Ok(SearchOutcome::Found(cached));
            }
            Ok(_) => debug!("Cache miss for {}", record.hash_id),
            Err(e) => warn!("Cache lookup failed, asking the database: {e}"),
        }

        match self.database.find_by_username(&record.hash_username).await? {
            None => Ok(SearchOutcome::NotFound),
            Some(stored) if stored.hash_id == record.hash_id => {
                self.cache_quietly(&stored).await;
                Ok(SearchOutcome::Found(stored))
            }
            Some(_) => Ok(SearchOutcome::CredentialMismatch),
        }
    }

    pub async fn upsert(&self, record: &StudentRecord) -> Result<UpsertOutcome, StoreError> {
        let outcome = match self.search(record).await? {
            SearchOutcome::NotFound => {
                self.database.insert(record).await?;
                UpsertOutcome::Inserted
            }
            SearchOutcome::Found(_) => {
                self.database.update(record).await?;
                UpsertOutcome::Updated
            }
            SearchOutcome::CredentialMismatch => return Err(StoreError::CredentialMismatch),
        };
        self.cache_quietly(record).await;
        info!("Stored record for {} ({outcome:?})", record.hash_username);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryCache {
        entries: Mutex<HashMap<String, StudentRecord>>,
        broken: bool,
    }

    #[async_trait]
    impl RecordCache for MemoryCache {
        async fn get(&self, hash_id: &str) -> Result<Option<StudentRecord>, StoreError> {
            if self.broken {
                return Err(redis::RedisError::from((redis::ErrorKind::IoError, "down")).into());
            }
            Ok(self.entries.lock().unwrap().get(hash_id).cloned())
        }

        async fn put(&self, record: &StudentRecord) -> Result<(), StoreError> {
            if self.broken {
                return Err(redis::RedisError::from((redis::ErrorKind::IoError, "down")).into());
            }
            self.entries
                .lock()
                .unwrap()
                .insert(record.hash_id.clone(), record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryDatabase {
        rows: Mutex<HashMap<String, StudentRecord>>,
    }

    #[async_trait]
    impl RecordDatabase for MemoryDatabase {
        async fn find_by_username(
            &self,
            hash_username: &str,
        ) -> Result<Option<StudentRecord>, StoreError> {
            Ok(self.rows.lock().unwrap().get(hash_username).cloned())
        }

        async fn insert(&self, record: &StudentRecord) -> Result<(), StoreError> {
            self.rows
                .lock()
                .unwrap()
                .insert(record.hash_username.clone(), record.clone());
            Ok(())
        }

        async fn update(&self, record: &StudentRecord) -> Result<(), StoreError> {
            self.insert(record).await
        }
    }

    fn record(password: &str, achievement: &str) -> StudentRecord {
        StudentRecord::new(
            &Credentials::new("2023010101", password),
            "张三",
            "[]",
            achievement,
        )
    }

    #[test]
    fn record_fields_round_trip_through_a_hash() {
        let original = record("secret1", "[1]");
        let map = original
            .fields()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(StudentRecord::from_fields(map), original);
    }

    #[tokio::test]
    async fn first_upsert_inserts_then_updates() {
        let store = RecordStore::new(MemoryCache::default(), MemoryDatabase::default());
        let first = record("secret1", "[1]");

        assert_eq!(store.search(&first).await.unwrap(), SearchOutcome::NotFound);
        assert_eq!(store.upsert(&first).await.unwrap(), UpsertOutcome::Inserted);

        let second = record("secret1", "[1,2]");
        assert_eq!(store.upsert(&second).await.unwrap(), UpsertOutcome::Updated);
        let stored = store
            .database
            .find_by_username(&second.hash_username)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.achievement, "[1,2]");
    }

    #[tokio::test]
    async fn database_hit_refills_cache() {
        let store = RecordStore::new(MemoryCache::default(), MemoryDatabase::default());
        let stored = record("secret1", "[1]");
        store.database.insert(&stored).await.unwrap();

        assert_eq!(
            store.search(&stored).await.unwrap(),
            SearchOutcome::Found(stored.clone())
        );
        assert_eq!(
            store.cache.get(&stored.hash_id).await.unwrap(),
            Some(stored)
        );
    }

    #[tokio::test]
    async fn cached_record_without_data_is_ignored() {
        let store = RecordStore::new(MemoryCache::default(), MemoryDatabase::default());
        let hollow = record("secret1", "");
        store.cache.put(&hollow).await.unwrap();
        assert_eq!(store.search(&hollow).await.unwrap(), SearchOutcome::NotFound);
    }

    #[tokio::test]
    async fn other_password_is_a_mismatch() {
        let store = RecordStore::new(MemoryCache::default(), MemoryDatabase::default());
        store.upsert(&record("secret1", "[1]")).await.unwrap();

        let imposter = record("guessed", "[9]");
        assert_eq!(
            store.search(&imposter).await.unwrap(),
            SearchOutcome::CredentialMismatch
        );
        assert!(matches!(
            store.upsert(&imposter).await,
            Err(StoreError::CredentialMismatch)
        ));
    }

    #[tokio::test]
    async fn broken_cache_falls_through_to_database() {
        let cache = MemoryCache {
            broken: true,
            ..MemoryCache::default()
        };
        let store = RecordStore::new(cache, MemoryDatabase::default());
        let first = record("secret1", "[1]");
        assert_eq!(store.upsert(&first).await.unwrap(), UpsertOutcome::Inserted);
        assert!(matches!(
            store.search(&first).await.unwrap(),
            SearchOutcome::Found(_)
        ));
    }
}
