// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use crate::error::CoreError;
use crate::status::{ClusterTask, InstanceTask, ServiceStatus};

use super::{
    ClusterRecord, InstanceRecord, NewCluster, NewInstance, Persistence, ServiceStatusRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const INSTANCE_COLUMNS: &str = "instance_id, tenant_id, name, cluster_id, flavor_id, volume_size, \
     datastore_version_id, task, replica_of, deleted, created_at, updated_at, deleted_at";

const CLUSTER_COLUMNS: &str = "cluster_id, name, tenant_id, datastore_version_id, task, deleted, \
     deleted_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct ServiceStatusRow {
    instance_id: String,
    status: String,
    heartbeat_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ServiceStatusRow> for ServiceStatusRecord {
    type Error = CoreError;

    fn try_from(row: ServiceStatusRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: ServiceStatus::from_description(&row.status)?,
            instance_id: row.instance_id,
            heartbeat_at: row.heartbeat_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    tenant_id: String,
    name: String,
    cluster_id: Option<String>,
    flavor_id: String,
    volume_size: Option<i64>,
    datastore_version_id: String,
    task: String,
    replica_of: Option<String>,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            task: row.task.parse()?,
            instance_id: row.instance_id,
            tenant_id: row.tenant_id,
            name: row.name,
            cluster_id: row.cluster_id,
            flavor_id: row.flavor_id,
            volume_size: row.volume_size,
            datastore_version_id: row.datastore_version_id,
            replica_of: row.replica_of,
            deleted: row.deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClusterRow {
    cluster_id: String,
    name: String,
    tenant_id: String,
    datastore_version_id: String,
    task: String,
    deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ClusterRow> for ClusterRecord {
    type Error = CoreError;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            task: row.task.parse()?,
            cluster_id: row.cluster_id,
            name: row.name,
            tenant_id: row.tenant_id,
            datastore_version_id: row.datastore_version_id,
            deleted: row.deleted,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already be migrated (see [`crate::migrations::run_sqlite`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/keel.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_instances(
        &self,
        filter_column: &str,
        value: &str,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances \
             WHERE {filter_column} = ? AND deleted = 0 \
             ORDER BY created_at ASC, instance_id ASC"
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    async fn update_instance_column(
        &self,
        instance_id: &str,
        column: &str,
        value: Option<&str>,
    ) -> Result<(), CoreError> {
        let sql = format!(
            "UPDATE instances SET {column} = ?, updated_at = ? \
             WHERE instance_id = ? AND deleted = 0"
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now())
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_cluster_column(
        &self,
        cluster_id: &str,
        column: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        let sql = format!(
            "UPDATE clusters SET {column} = ?, updated_at = ? \
             WHERE cluster_id = ? AND deleted = 0"
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now())
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ClusterNotFound {
                cluster_id: cluster_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn init_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_statuses (instance_id, status, heartbeat_at, updated_at)
            VALUES (?1, ?2, NULL, ?3)
            ON CONFLICT (instance_id) DO UPDATE
            SET status = ?2, heartbeat_at = NULL, updated_at = ?3
            "#,
        )
        .bind(instance_id)
        .bind(status.description())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_service_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<ServiceStatusRecord>, CoreError> {
        let row = sqlx::query_as::<_, ServiceStatusRow>(
            r#"
            SELECT instance_id, status, heartbeat_at, updated_at
            FROM service_statuses
            WHERE instance_id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ServiceStatusRecord::try_from).transpose()
    }

    async fn record_heartbeat(
        &self,
        instance_id: &str,
        status: ServiceStatus,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT heartbeat_at FROM service_statuses WHERE instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((last_heartbeat,)) = current else {
            return Err(CoreError::ServiceStatusNotFound {
                instance_id: instance_id.to_string(),
            });
        };

        if let Some(last) = last_heartbeat
            && sent_at < last
        {
            debug!(instance_id = %instance_id, sent_at = %sent_at, last = %last, "Dropping out-of-order heartbeat");
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE service_statuses
            SET status = ?, heartbeat_at = ?, updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(status.description())
        .bind(sent_at)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn set_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE service_statuses
            SET status = ?, updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(status.description())
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ServiceStatusNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_stale_service_statuses(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ServiceStatusRecord>, CoreError> {
        // Text timestamps do not order reliably, so the cutoff is applied here.
        let rows = sqlx::query_as::<_, ServiceStatusRow>(
            r#"
            SELECT instance_id, status, heartbeat_at, updated_at
            FROM service_statuses
            WHERE heartbeat_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stale = Vec::new();
        for row in rows {
            let record = ServiceStatusRecord::try_from(row)?;
            if record.heartbeat_at.is_some_and(|at| at < cutoff) {
                stale.push(record);
            }
        }
        Ok(stale)
    }

    async fn register_instance(&self, instance: &NewInstance) -> Result<(), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO instances (
                instance_id, tenant_id, name, cluster_id, flavor_id, volume_size,
                datastore_version_id, task, replica_of, deleted, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.tenant_id)
        .bind(&instance.name)
        .bind(&instance.cluster_id)
        .bind(&instance.flavor_id)
        .bind(instance.volume_size)
        .bind(&instance.datastore_version_id)
        .bind(InstanceTask::Building.as_str())
        .bind(&instance.replica_of)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::InstanceAlreadyExists {
                instance_id: instance.instance_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let sql =
            format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ? AND deleted = 0");
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn update_instance_task(
        &self,
        instance_id: &str,
        task: InstanceTask,
    ) -> Result<(), CoreError> {
        self.update_instance_column(instance_id, "task", Some(task.as_str()))
            .await
    }

    async fn claim_instance_task(
        &self,
        instance_id: &str,
        from: &[InstanceTask],
        to: InstanceTask,
    ) -> Result<Result<(), InstanceTask>, CoreError> {
        let sql = format!(
            "UPDATE instances SET task = ?, updated_at = ? \
             WHERE instance_id = ? AND deleted = 0 AND task IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now())
            .bind(instance_id);
        for task in from {
            query = query.bind(task.as_str());
        }
        if query.execute(&self.pool).await?.rows_affected() > 0 {
            return Ok(Ok(()));
        }

        let current: Option<(String,)> =
            sqlx::query_as("SELECT task FROM instances WHERE instance_id = ? AND deleted = 0")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            Some((current,)) => Ok(Err(current.parse()?)),
            None => Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    async fn update_instance_flavor(
        &self,
        instance_id: &str,
        flavor_id: &str,
    ) -> Result<(), CoreError> {
        self.update_instance_column(instance_id, "flavor_id", Some(flavor_id))
            .await
    }

    async fn update_instance_datastore_version(
        &self,
        instance_id: &str,
        datastore_version_id: &str,
    ) -> Result<(), CoreError> {
        self.update_instance_column(instance_id, "datastore_version_id", Some(datastore_version_id))
            .await
    }

    async fn set_instance_replica_of(
        &self,
        instance_id: &str,
        replica_of: Option<&str>,
    ) -> Result<(), CoreError> {
        self.update_instance_column(instance_id, "replica_of", replica_of)
            .await
    }

    async fn list_replicas(&self, master_id: &str) -> Result<Vec<InstanceRecord>, CoreError> {
        self.fetch_instances("replica_of", master_id).await
    }

    async fn list_cluster_instances(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        self.fetch_instances("cluster_id", cluster_id).await
    }

    async fn mark_instance_deleted(&self, instance_id: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET deleted = 1, deleted_at = ?, updated_at = ?, task = ?
            WHERE instance_id = ? AND deleted = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(InstanceTask::None.as_str())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_cluster(&self, cluster: &NewCluster) -> Result<(), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO clusters (
                cluster_id, name, tenant_id, datastore_version_id, task, deleted,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&cluster.cluster_id)
        .bind(&cluster.name)
        .bind(&cluster.tenant_id)
        .bind(&cluster.datastore_version_id)
        .bind(ClusterTask::BuildingInitial.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::ClusterAlreadyExists {
                cluster_id: cluster.cluster_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, CoreError> {
        let sql =
            format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE cluster_id = ? AND deleted = 0");
        let row = sqlx::query_as::<_, ClusterRow>(&sql)
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ClusterRecord::try_from).transpose()
    }

    async fn update_cluster_task(
        &self,
        cluster_id: &str,
        task: ClusterTask,
    ) -> Result<(), CoreError> {
        self.update_cluster_column(cluster_id, "task", task.as_str())
            .await
    }

    async fn claim_cluster_task(
        &self,
        cluster_id: &str,
        from: &[ClusterTask],
        to: ClusterTask,
    ) -> Result<Result<(), ClusterTask>, CoreError> {
        let sql = format!(
            "UPDATE clusters SET task = ?, updated_at = ? \
             WHERE cluster_id = ? AND deleted = 0 AND task IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now())
            .bind(cluster_id);
        for task in from {
            query = query.bind(task.as_str());
        }
        if query.execute(&self.pool).await?.rows_affected() > 0 {
            return Ok(Ok(()));
        }

        let current: Option<(String,)> =
            sqlx::query_as("SELECT task FROM clusters WHERE cluster_id = ? AND deleted = 0")
                .bind(cluster_id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            Some((current,)) => Ok(Err(current.parse()?)),
            None => Err(CoreError::ClusterNotFound {
                cluster_id: cluster_id.to_string(),
            }),
        }
    }

    async fn update_cluster_datastore_version(
        &self,
        cluster_id: &str,
        datastore_version_id: &str,
    ) -> Result<(), CoreError> {
        self.update_cluster_column(cluster_id, "datastore_version_id", datastore_version_id)
            .await
    }

    async fn mark_cluster_deleted(&self, cluster_id: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET deleted = 1, deleted_at = ?, updated_at = ?, task = ?
            WHERE cluster_id = ? AND deleted = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(ClusterTask::None.as_str())
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ClusterNotFound {
                cluster_id: cluster_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_clusters(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<Vec<ClusterRecord>, CoreError> {
        let sql = format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters \
             WHERE deleted = 0 AND (?1 IS NULL OR tenant_id = ?1) \
             ORDER BY created_at ASC, cluster_id ASC"
        );
        let rows = sqlx::query_as::<_, ClusterRow>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ClusterRecord::try_from).collect()
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
