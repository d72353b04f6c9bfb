//! SQLite storage backend for sync-state.

use super::{
    CacheRecord, CommitOutcome, DeviceRecord, MapRow, StateCommit, StateRow, StateStorage,
};
use crate::error::StorageError;
use async_trait::async_trait;
use eas_sync_types::{ChangeType, CollectionClass, CollectionId, DeviceId, RwStatus, UserId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-based sync-state storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path, max_connections: u32) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS sync_cache (
                device_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                data BLOB NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (device_id, user_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                device_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                folder_id TEXT NOT NULL,
                series TEXT NOT NULL,
                counter INTEGER NOT NULL,
                data BLOB NOT NULL,
                pending BLOB,
                sync_time INTEGER NOT NULL,
                PRIMARY KEY (device_id, user_id, folder_id, series, counter)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_map (
                device_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                folder_id TEXT NOT NULL,
                series TEXT NOT NULL,
                counter INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                client_id TEXT,
                change_type TEXT NOT NULL,
                revision INTEGER,
                timestamp INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                device_type TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                policy_key INTEGER,
                rw_status INTEGER NOT NULL DEFAULT 0,
                supported BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (device_id, user_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_map_key ON sync_map(device_id, user_id, folder_id, series, counter)",
            "CREATE INDEX IF NOT EXISTS idx_map_client ON sync_map(device_id, user_id, folder_id, client_id)",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        Ok(())
    }
}

fn change_type_code(change: ChangeType) -> &'static str {
    match change {
        ChangeType::Change => "change",
        ChangeType::Delete => "delete",
        ChangeType::Flags => "flags",
        ChangeType::Move => "move",
    }
}

fn parse_change_type(code: &str) -> Result<ChangeType, StorageError> {
    match code {
        "change" => Ok(ChangeType::Change),
        "delete" => Ok(ChangeType::Delete),
        "flags" => Ok(ChangeType::Flags),
        "move" => Ok(ChangeType::Move),
        other => Err(StorageError::NotFound {
            what: format!("change type {other}"),
        }),
    }
}

#[async_trait]
impl StateStorage for SqliteStorage {
    async fn load_cache(
        &self,
        device: &DeviceId,
        user: &UserId,
    ) -> Result<Option<CacheRecord>, StorageError> {
        let row: Option<(Vec<u8>, i64, i64)> = sqlx::query_as(
            r#"
            SELECT data, version, updated_at FROM sync_cache
            WHERE device_id = ?1 AND user_id = ?2
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(data, version, updated_at)| CacheRecord {
            data,
            version,
            updated_at,
        }))
    }

    async fn store_cache(
        &self,
        device: &DeviceId,
        user: &UserId,
        data: &[u8],
        expected_version: Option<i64>,
        updated_at: i64,
    ) -> Result<Option<i64>, StorageError> {
        let result = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO sync_cache (device_id, user_id, data, version, updated_at)
                    VALUES (?1, ?2, ?3, 1, ?4)
                    ON CONFLICT(device_id, user_id) DO NOTHING
                    "#,
                )
                .bind(device.as_str())
                .bind(user.as_str())
                .bind(data)
                .bind(updated_at)
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    r#"
                    UPDATE sync_cache SET data = ?3, version = version + 1, updated_at = ?4
                    WHERE device_id = ?1 AND user_id = ?2 AND version = ?5
                    "#,
                )
                .bind(device.as_str())
                .bind(user.as_str())
                .bind(data)
                .bind(updated_at)
                .bind(version)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(expected_version.map_or(1, |v| v + 1)))
    }

    async fn delete_cache(&self, device: &DeviceId, user: &UserId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_cache WHERE device_id = ?1 AND user_id = ?2")
            .bind(device.as_str())
            .bind(user.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_state(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        series: &str,
        counter: u64,
    ) -> Result<Option<StateRow>, StorageError> {
        let row = sqlx::query_as::<_, StateRowDb>(
            r#"
            SELECT device_id, user_id, folder_id, series, counter, data, pending, sync_time
            FROM sync_state
            WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3
              AND series = ?4 AND counter = ?5
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .bind(folder.as_str())
        .bind(series)
        .bind(counter as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn latest_counter(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        series: &str,
    ) -> Result<Option<u64>, StorageError> {
        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(counter) FROM sync_state
            WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3 AND series = ?4
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .bind(folder.as_str())
        .bind(series)
        .fetch_one(&self.pool)
        .await?;

        Ok(latest.map(|c| c as u64))
    }

    async fn commit_state(&self, commit: StateCommit) -> Result<CommitOutcome, StorageError> {
        let StateCommit {
            row,
            expected_latest,
            map,
        } = commit;

        let mut tx = self.pool.begin().await?;

        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(counter) FROM sync_state
            WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3 AND series = ?4
            "#,
        )
        .bind(row.device_id.as_str())
        .bind(row.user_id.as_str())
        .bind(row.folder_id.as_str())
        .bind(&row.series)
        .fetch_one(&mut *tx)
        .await?;
        let latest = latest.map(|c| c as u64);

        if latest != expected_latest {
            tx.rollback().await?;
            return Ok(CommitOutcome::Stale { latest });
        }

        // A retried round re-issues the same key; replace what it wrote.
        for table in ["sync_state", "sync_map"] {
            let sql = format!(
                "DELETE FROM {table} WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3 \
                 AND series = ?4 AND counter = ?5"
            );
            sqlx::query(&sql)
                .bind(row.device_id.as_str())
                .bind(row.user_id.as_str())
                .bind(row.folder_id.as_str())
                .bind(&row.series)
                .bind(row.counter as i64)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO sync_state
                (device_id, user_id, folder_id, series, counter, data, pending, sync_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(row.device_id.as_str())
        .bind(row.user_id.as_str())
        .bind(row.folder_id.as_str())
        .bind(&row.series)
        .bind(row.counter as i64)
        .bind(&row.data)
        .bind(&row.pending)
        .bind(row.sync_time)
        .execute(&mut *tx)
        .await?;

        for entry in &map {
            sqlx::query(
                r#"
                INSERT INTO sync_map
                    (device_id, user_id, folder_id, series, counter,
                     message_id, client_id, change_type, revision, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(row.device_id.as_str())
            .bind(row.user_id.as_str())
            .bind(row.folder_id.as_str())
            .bind(&row.series)
            .bind(row.counter as i64)
            .bind(&entry.message_id)
            .bind(&entry.client_id)
            .bind(change_type_code(entry.change_type))
            .bind(entry.revision.map(|r| r as i64))
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn load_map(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        series: &str,
        counter: u64,
    ) -> Result<Vec<MapRow>, StorageError> {
        let rows = sqlx::query_as::<_, MapRowDb>(
            r#"
            SELECT message_id, client_id, change_type, revision, timestamp
            FROM sync_map
            WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3
              AND series = ?4 AND counter = ?5
            ORDER BY timestamp ASC
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .bind(folder.as_str())
        .bind(series)
        .bind(counter as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_client_id(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        client_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT message_id FROM sync_map
            WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3 AND client_id = ?4
            ORDER BY counter DESC
            LIMIT 1
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .bind(folder.as_str())
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn reset_collection(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sync_map WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3")
            .bind(device.as_str())
            .bind(user.as_str())
            .bind(folder.as_str())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "DELETE FROM sync_state WHERE device_id = ?1 AND user_id = ?2 AND folder_id = ?3",
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .bind(folder.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn remove_device_state(
        &self,
        device: &DeviceId,
        user: Option<&UserId>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for table in ["sync_map", "sync_state", "sync_cache", "devices"] {
            match user {
                Some(user) => {
                    let sql = format!("DELETE FROM {table} WHERE device_id = ?1 AND user_id = ?2");
                    sqlx::query(&sql)
                        .bind(device.as_str())
                        .bind(user.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    let sql = format!("DELETE FROM {table} WHERE device_id = ?1");
                    sqlx::query(&sql)
                        .bind(device.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_device(&self, device: &DeviceRecord) -> Result<(), StorageError> {
        let supported = rmp_serde::to_vec(&device.supported)?;

        sqlx::query(
            r#"
            INSERT INTO devices
                (device_id, user_id, device_type, user_agent, policy_key, rw_status, supported)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(device_id, user_id) DO UPDATE SET
                device_type = ?3, user_agent = ?4, policy_key = ?5,
                rw_status = ?6, supported = ?7
            "#,
        )
        .bind(device.device_id.as_str())
        .bind(device.user_id.as_str())
        .bind(&device.device_type)
        .bind(&device.user_agent)
        .bind(device.policy_key.map(|k| k as i64))
        .bind(device.rw_status as u8 as i64)
        .bind(supported)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_device(
        &self,
        device: &DeviceId,
        user: &UserId,
    ) -> Result<Option<DeviceRecord>, StorageError> {
        let row = sqlx::query_as::<_, DeviceRowDb>(
            r#"
            SELECT device_id, user_id, device_type, user_agent, policy_key, rw_status, supported
            FROM devices WHERE device_id = ?1 AND user_id = ?2
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn set_policy_key(&self, device: &DeviceId, key: u64) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE devices SET policy_key = ?2 WHERE device_id = ?1")
            .bind(device.as_str())
            .bind(key as i64)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                what: format!("device {device}"),
            });
        }
        Ok(())
    }

    async fn set_rw_status(
        &self,
        device: &DeviceId,
        status: RwStatus,
    ) -> Result<(), StorageError> {
        let sql = if status == RwStatus::Pending {
            "UPDATE devices SET rw_status = ?2, policy_key = NULL WHERE device_id = ?1"
        } else {
            "UPDATE devices SET rw_status = ?2 WHERE device_id = ?1"
        };

        let result = sqlx::query(sql)
            .bind(device.as_str())
            .bind(status as u8 as i64)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                what: format!("device {device}"),
            });
        }
        Ok(())
    }

    async fn list_devices(&self, user: Option<&UserId>) -> Result<Vec<DeviceRecord>, StorageError> {
        let rows = match user {
            Some(user) => {
                sqlx::query_as::<_, DeviceRowDb>(
                    r#"
                    SELECT device_id, user_id, device_type, user_agent, policy_key, rw_status, supported
                    FROM devices WHERE user_id = ?1 ORDER BY device_id
                    "#,
                )
                .bind(user.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DeviceRowDb>(
                    r#"
                    SELECT device_id, user_id, device_type, user_agent, policy_key, rw_status, supported
                    FROM devices ORDER BY device_id, user_id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn gc_states(&self, keep: u32) -> Result<u64, StorageError> {
        let keep = keep.max(1) as i64;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM sync_map WHERE counter <= (
                SELECT MAX(s.counter) FROM sync_state s
                WHERE s.device_id = sync_map.device_id AND s.user_id = sync_map.user_id
                  AND s.folder_id = sync_map.folder_id AND s.series = sync_map.series
            ) - ?1
            "#,
        )
        .bind(keep)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM sync_state WHERE counter <= (
                SELECT MAX(s.counter) FROM sync_state s
                WHERE s.device_id = sync_state.device_id AND s.user_id = sync_state.user_id
                  AND s.folder_id = sync_state.folder_id AND s.series = sync_state.series
            ) - ?1
            "#,
        )
        .bind(keep)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

/// Internal row type for `sync_state` queries.
#[derive(sqlx::FromRow)]
struct StateRowDb {
    device_id: String,
    user_id: String,
    folder_id: String,
    series: String,
    counter: i64,
    data: Vec<u8>,
    pending: Option<Vec<u8>>,
    sync_time: i64,
}

impl From<StateRowDb> for StateRow {
    fn from(row: StateRowDb) -> Self {
        StateRow {
            device_id: DeviceId::new(row.device_id),
            user_id: UserId::new(row.user_id),
            folder_id: CollectionId::new(row.folder_id),
            series: row.series,
            counter: row.counter as u64,
            data: row.data,
            pending: row.pending,
            sync_time: row.sync_time,
        }
    }
}

/// Internal row type for `sync_map` queries.
#[derive(sqlx::FromRow)]
struct MapRowDb {
    message_id: String,
    client_id: Option<String>,
    change_type: String,
    revision: Option<i64>,
    timestamp: i64,
}

impl TryFrom<MapRowDb> for MapRow {
    type Error = StorageError;

    fn try_from(row: MapRowDb) -> Result<Self, Self::Error> {
        Ok(MapRow {
            message_id: row.message_id,
            client_id: row.client_id,
            change_type: parse_change_type(&row.change_type)?,
            revision: row.revision.map(|r| r as u64),
            timestamp: row.timestamp,
        })
    }
}

/// Internal row type for `devices` queries.
#[derive(sqlx::FromRow)]
struct DeviceRowDb {
    device_id: String,
    user_id: String,
    device_type: String,
    user_agent: String,
    policy_key: Option<i64>,
    rw_status: i64,
    supported: Vec<u8>,
}

impl TryFrom<DeviceRowDb> for DeviceRecord {
    type Error = StorageError;

    fn try_from(row: DeviceRowDb) -> Result<Self, Self::Error> {
        let supported: Vec<CollectionClass> = rmp_serde::from_slice(&row.supported)?;
        Ok(DeviceRecord {
            device_id: DeviceId::new(row.device_id),
            user_id: UserId::new(row.user_id),
            device_type: row.device_type,
            user_agent: row.user_agent,
            policy_key: row.policy_key.map(|k| k as u64),
            rw_status: RwStatus::from_code(row.rw_status as u8).unwrap_or(RwStatus::Na),
            supported,
        })
    }
}
