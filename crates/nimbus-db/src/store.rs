//! SQLite implementation of the [`CloudStore`] capability.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::{
    CloudError, CloudInstance, CloudStore, ConnectionInfo, DedicatedHost, InstanceFilters,
    InstanceState, Result,
};
use sqlx::FromRow;

use crate::pool::DbPool;

/// Cloud instance and dedicated host persistence over SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS cloud_instances (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                state TEXT NOT NULL,
                provider TEXT NOT NULL,
                instance_id TEXT NOT NULL DEFAULT '',
                instance_type TEXT NOT NULL DEFAULT '',
                image_id TEXT NOT NULL DEFAULT '',
                region TEXT NOT NULL DEFAULT '',
                bot_package TEXT NOT NULL DEFAULT '',
                bot_version TEXT NOT NULL DEFAULT '',
                public_ip TEXT NOT NULL DEFAULT '',
                private_ip TEXT NOT NULL DEFAULT '',
                agent_node_id TEXT NOT NULL DEFAULT '',
                team_id TEXT NOT NULL DEFAULT '',
                dedicated_host_id TEXT NOT NULL DEFAULT '',
                hourly_rate_cents INTEGER NOT NULL DEFAULT 0,
                accrued_cost_cents INTEGER NOT NULL DEFAULT 0,
                billing_tier TEXT NOT NULL DEFAULT '',
                connection_info TEXT,
                metadata TEXT,
                tags TEXT,
                error_message TEXT NOT NULL DEFAULT '',
                requested_at TEXT NOT NULL,
                provisioned_at TEXT,
                terminated_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_cloud_instances_team_state ON cloud_instances (team_id, state)",
            "CREATE INDEX IF NOT EXISTS idx_cloud_instances_state ON cloud_instances (state)",
            r#"
            CREATE TABLE IF NOT EXISTS dedicated_hosts (
                id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL UNIQUE,
                instance_type TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL,
                current_instance_id TEXT NOT NULL DEFAULT '',
                allocated_at TEXT,
                released_at TEXT,
                min_allocation_secs INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(self.pool.inner())
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> CloudError {
    CloudError::Database(e.to_string())
}

#[derive(Debug, FromRow)]
struct InstanceRow {
    id: String,
    platform: String,
    state: String,
    provider: String,
    instance_id: String,
    instance_type: String,
    image_id: String,
    region: String,
    bot_package: String,
    bot_version: String,
    public_ip: String,
    private_ip: String,
    agent_node_id: String,
    team_id: String,
    dedicated_host_id: String,
    hourly_rate_cents: i64,
    accrued_cost_cents: i64,
    billing_tier: String,
    connection_info: Option<String>,
    metadata: Option<String>,
    tags: Option<String>,
    error_message: String,
    requested_at: DateTime<Utc>,
    provisioned_at: Option<DateTime<Utc>>,
    terminated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InstanceRow {
    fn into_instance(self) -> Result<CloudInstance> {
        let connection_info: Option<ConnectionInfo> = match self.connection_info.as_deref() {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };
        let metadata: Option<serde_json::Value> = match self.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };
        let tags: HashMap<String, String> = match self.tags.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => HashMap::new(),
        };

        Ok(CloudInstance {
            id: self.id,
            platform: self.platform.parse()?,
            state: self.state.parse()?,
            provider: self.provider,
            instance_id: self.instance_id,
            instance_type: self.instance_type,
            image_id: self.image_id,
            region: self.region,
            bot_package: self.bot_package,
            bot_version: self.bot_version,
            public_ip: self.public_ip,
            private_ip: self.private_ip,
            agent_node_id: self.agent_node_id,
            team_id: self.team_id,
            dedicated_host_id: self.dedicated_host_id,
            hourly_rate_cents: self.hourly_rate_cents,
            accrued_cost_cents: self.accrued_cost_cents,
            billing_tier: self.billing_tier,
            connection_info,
            metadata,
            tags,
            error_message: self.error_message,
            requested_at: self.requested_at,
            provisioned_at: self.provisioned_at,
            terminated_at: self.terminated_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct HostRow {
    id: String,
    host_id: String,
    instance_type: String,
    state: String,
    current_instance_id: String,
    allocated_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
    min_allocation_secs: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl HostRow {
    fn into_host(self) -> Result<DedicatedHost> {
        Ok(DedicatedHost {
            id: self.id,
            host_id: self.host_id,
            instance_type: self.instance_type,
            state: self.state.parse()?,
            current_instance_id: self.current_instance_id,
            allocated_at: self.allocated_at,
            released_at: self.released_at,
            min_allocation: Duration::from_secs(self.min_allocation_secs.max(0) as u64),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn json_column<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(CloudError::from))
        .transpose()
}

#[async_trait]
impl CloudStore for SqliteStore {
    async fn create_cloud_instance(&self, instance: &CloudInstance) -> Result<()> {
        let tags = if instance.tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&instance.tags)?)
        };
        sqlx::query(
            r#"
            INSERT INTO cloud_instances (
                id, platform, state, provider, instance_id, instance_type, image_id, region,
                bot_package, bot_version, public_ip, private_ip, agent_node_id, team_id,
                dedicated_host_id, hourly_rate_cents, accrued_cost_cents, billing_tier,
                connection_info, metadata, tags, error_message,
                requested_at, provisioned_at, terminated_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(instance.platform.as_str())
        .bind(instance.state.as_str())
        .bind(&instance.provider)
        .bind(&instance.instance_id)
        .bind(&instance.instance_type)
        .bind(&instance.image_id)
        .bind(&instance.region)
        .bind(&instance.bot_package)
        .bind(&instance.bot_version)
        .bind(&instance.public_ip)
        .bind(&instance.private_ip)
        .bind(&instance.agent_node_id)
        .bind(&instance.team_id)
        .bind(&instance.dedicated_host_id)
        .bind(instance.hourly_rate_cents)
        .bind(instance.accrued_cost_cents)
        .bind(&instance.billing_tier)
        .bind(json_column(&instance.connection_info)?)
        .bind(json_column(&instance.metadata)?)
        .bind(tags)
        .bind(&instance.error_message)
        .bind(instance.requested_at)
        .bind(instance.provisioned_at)
        .bind(instance.terminated_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(self.pool.inner())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_cloud_instance(&self, id: &str) -> Result<CloudInstance> {
        let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM cloud_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await
            .map_err(db_err)?;

        row.ok_or(CloudError::InstanceNotFound)?.into_instance()
    }

    async fn get_cloud_instance_by_agent_node(&self, agent_node_id: &str) -> Result<CloudInstance> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM cloud_instances WHERE agent_node_id = ?",
        )
        .bind(agent_node_id)
        .fetch_optional(self.pool.inner())
        .await
        .map_err(db_err)?;

        row.ok_or(CloudError::InstanceNotFound)?.into_instance()
    }

    async fn update_cloud_instance(&self, instance: &CloudInstance) -> Result<()> {
        let tags = if instance.tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&instance.tags)?)
        };
        let result = sqlx::query(
            r#"
            UPDATE cloud_instances SET
                platform = ?, state = ?, provider = ?, instance_id = ?, instance_type = ?,
                image_id = ?, region = ?, bot_package = ?, bot_version = ?, public_ip = ?,
                private_ip = ?, agent_node_id = ?, team_id = ?, dedicated_host_id = ?,
                hourly_rate_cents = ?, accrued_cost_cents = ?, billing_tier = ?,
                connection_info = ?, metadata = ?, tags = ?, error_message = ?,
                requested_at = ?, provisioned_at = ?, terminated_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(instance.platform.as_str())
        .bind(instance.state.as_str())
        .bind(&instance.provider)
        .bind(&instance.instance_id)
        .bind(&instance.instance_type)
        .bind(&instance.image_id)
        .bind(&instance.region)
        .bind(&instance.bot_package)
        .bind(&instance.bot_version)
        .bind(&instance.public_ip)
        .bind(&instance.private_ip)
        .bind(&instance.agent_node_id)
        .bind(&instance.team_id)
        .bind(&instance.dedicated_host_id)
        .bind(instance.hourly_rate_cents)
        .bind(instance.accrued_cost_cents)
        .bind(&instance.billing_tier)
        .bind(json_column(&instance.connection_info)?)
        .bind(json_column(&instance.metadata)?)
        .bind(tags)
        .bind(&instance.error_message)
        .bind(instance.requested_at)
        .bind(instance.provisioned_at)
        .bind(instance.terminated_at)
        .bind(instance.updated_at)
        .bind(&instance.id)
        .execute(self.pool.inner())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CloudError::InstanceNotFound);
        }
        Ok(())
    }

    async fn delete_cloud_instance(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cloud_instances WHERE id = ?")
            .bind(id)
            .execute(self.pool.inner())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_cloud_instances(&self, filters: &InstanceFilters) -> Result<Vec<CloudInstance>> {
        let mut sql = String::from("SELECT * FROM cloud_instances");
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(platform) = filters.platform {
            clauses.push("platform = ?");
            binds.push(platform.as_str().to_string());
        }
        if let Some(state) = filters.state {
            clauses.push("state = ?");
            binds.push(state.as_str().to_string());
        }
        if let Some(team_id) = &filters.team_id {
            clauses.push("team_id = ?");
            binds.push(team_id.clone());
        }
        if let Some(provider) = &filters.provider {
            clauses.push("provider = ?");
            binds.push(provider.clone());
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filters.limit > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query_as::<_, InstanceRow>(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        if filters.limit > 0 {
            query = query.bind(filters.limit).bind(filters.offset.max(0));
        }

        let rows = query.fetch_all(self.pool.inner()).await.map_err(db_err)?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    async fn count_cloud_instances_by_team(&self, team_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cloud_instances
             WHERE team_id = ? AND state NOT IN ('terminated', 'failed')",
        )
        .bind(team_id)
        .fetch_one(self.pool.inner())
        .await
        .map_err(db_err)?;

        Ok(count)
    }

    async fn create_dedicated_host(&self, host: &DedicatedHost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dedicated_hosts (
                id, host_id, instance_type, state, current_instance_id,
                allocated_at, released_at, min_allocation_secs, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&host.id)
        .bind(&host.host_id)
        .bind(&host.instance_type)
        .bind(host.state.as_str())
        .bind(&host.current_instance_id)
        .bind(host.allocated_at)
        .bind(host.released_at)
        .bind(host.min_allocation.as_secs() as i64)
        .bind(host.created_at)
        .bind(host.updated_at)
        .execute(self.pool.inner())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_dedicated_host(&self, id: &str) -> Result<DedicatedHost> {
        let row = sqlx::query_as::<_, HostRow>("SELECT * FROM dedicated_hosts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await
            .map_err(db_err)?;

        row.ok_or_else(|| CloudError::HostNotFound(id.to_string()))?
            .into_host()
    }

    async fn get_dedicated_host_by_host_id(&self, host_id: &str) -> Result<DedicatedHost> {
        let row = sqlx::query_as::<_, HostRow>("SELECT * FROM dedicated_hosts WHERE host_id = ?")
            .bind(host_id)
            .fetch_optional(self.pool.inner())
            .await
            .map_err(db_err)?;

        row.ok_or_else(|| CloudError::HostNotFound(host_id.to_string()))?
            .into_host()
    }

    async fn update_dedicated_host(&self, host: &DedicatedHost) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dedicated_hosts SET
                host_id = ?, instance_type = ?, state = ?, current_instance_id = ?,
                allocated_at = ?, released_at = ?, min_allocation_secs = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&host.host_id)
        .bind(&host.instance_type)
        .bind(host.state.as_str())
        .bind(&host.current_instance_id)
        .bind(host.allocated_at)
        .bind(host.released_at)
        .bind(host.min_allocation.as_secs() as i64)
        .bind(host.updated_at)
        .bind(&host.id)
        .execute(self.pool.inner())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CloudError::HostNotFound(host.id.clone()));
        }
        Ok(())
    }

    async fn list_dedicated_hosts(&self) -> Result<Vec<DedicatedHost>> {
        let rows =
            sqlx::query_as::<_, HostRow>("SELECT * FROM dedicated_hosts ORDER BY created_at ASC")
                .fetch_all(self.pool.inner())
                .await
                .map_err(db_err)?;

        rows.into_iter().map(HostRow::into_host).collect()
    }

    async fn get_available_dedicated_host(&self) -> Result<DedicatedHost> {
        // Least-recently-updated first, to spread allocations across the fleet.
        let row = sqlx::query_as::<_, HostRow>(
            "SELECT * FROM dedicated_hosts
             WHERE state = 'available' AND current_instance_id = ''
             ORDER BY updated_at ASC LIMIT 1",
        )
        .fetch_optional(self.pool.inner())
        .await
        .map_err(db_err)?;

        row.ok_or(CloudError::NoAvailableHost)?.into_host()
    }

    async fn claim_dedicated_host(
        &self,
        id: &str,
        instance_id: &str,
        allocated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dedicated_hosts
             SET state = 'allocated', current_instance_id = ?, allocated_at = ?,
                 released_at = NULL, updated_at = ?
             WHERE id = ? AND state = 'available'",
        )
        .bind(instance_id)
        .bind(allocated_at)
        .bind(allocated_at)
        .bind(id)
        .execute(self.pool.inner())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }
}
