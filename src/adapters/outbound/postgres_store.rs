use crate::common::StateStore;
use crate::config::PostgresConfig;
use crate::domains::fleet::Agv;
use crate::domains::tasks::Task;
use crate::domains::world::WarehouseLayout;
use async_trait::async_trait;
use deadpool_postgres::{Config, GenericClient, Pool, PoolConfig, Runtime};
use tokio_postgres::NoTls;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS warehouse_layout (
        layout_id SMALLINT PRIMARY KEY DEFAULT 1,
        name VARCHAR(255) NOT NULL,
        layout JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS agvs (
        agv_id VARCHAR(64) PRIMARY KEY,
        version BIGINT NOT NULL,
        status VARCHAR(32) NOT NULL,
        battery DOUBLE PRECISION NOT NULL,
        cell_row INTEGER NOT NULL,
        cell_bay INTEGER NOT NULL,
        current_task_id UUID,
        state JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        task_id UUID PRIMARY KEY,
        seq BIGINT NOT NULL,
        version BIGINT NOT NULL,
        kind VARCHAR(32) NOT NULL,
        priority SMALLINT NOT NULL,
        status VARCHAR(32) NOT NULL,
        assigned_agv VARCHAR(64),
        state JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
    CREATE INDEX IF NOT EXISTS idx_tasks_assigned_agv ON tasks(assigned_agv);
"#;

// Upserts only move forward: a stale version never overwrites a newer row.
const UPSERT_AGV: &str = "INSERT INTO agvs
        (agv_id, version, status, battery, cell_row, cell_bay, current_task_id, state, updated_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
     ON CONFLICT (agv_id) DO UPDATE SET
        version = EXCLUDED.version,
        status = EXCLUDED.status,
        battery = EXCLUDED.battery,
        cell_row = EXCLUDED.cell_row,
        cell_bay = EXCLUDED.cell_bay,
        current_task_id = EXCLUDED.current_task_id,
        state = EXCLUDED.state,
        updated_at = EXCLUDED.updated_at
     WHERE agvs.version <= EXCLUDED.version";

const UPSERT_TASK: &str = "INSERT INTO tasks
        (task_id, seq, version, kind, priority, status, assigned_agv, state, created_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
     ON CONFLICT (task_id) DO UPDATE SET
        version = EXCLUDED.version,
        status = EXCLUDED.status,
        assigned_agv = EXCLUDED.assigned_agv,
        state = EXCLUDED.state
     WHERE tasks.version <= EXCLUDED.version";

/// State store backed by PostgreSQL. Entities are kept as JSONB documents
/// next to the columns operators query on.
pub struct PostgresStateStore {
    pool: Pool,
}

impl PostgresStateStore {
    pub async fn new(config: PostgresConfig) -> Result<Self, String> {
        let mut pg_config = Config::new();
        pg_config.host = Some(config.host);
        pg_config.port = Some(config.port);
        pg_config.dbname = Some(config.database);
        pg_config.user = Some(config.username);
        pg_config.password = Some(config.password);
        pg_config.pool = Some(PoolConfig::new(config.max_connections as usize));

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| format!("Failed to create PostgreSQL pool: {}", e))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), String> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| format!("Failed to initialize database schema: {}", e))
    }

    /// Write the layout and the initial fleet unless a layout is already
    /// stored. Returns whether anything was written.
    pub async fn provision(&self, layout: &WarehouseLayout, agvs: &[Agv]) -> Result<bool, String> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| format!("Failed to begin transaction: {}", e))?;

        let existing = tx
            .query_opt("SELECT layout_id FROM warehouse_layout WHERE layout_id = 1", &[])
            .await
            .map_err(|e| format!("Failed to read layout: {}", e))?;
        if existing.is_some() {
            return Ok(false);
        }

        let layout_json = serde_json::to_value(layout)
            .map_err(|e| format!("Failed to serialize layout: {}", e))?;
        tx.execute(
            "INSERT INTO warehouse_layout (layout_id, name, layout) VALUES (1, $1, $2)",
            &[&layout.name, &layout_json],
        )
        .await
        .map_err(|e| format!("Failed to store layout: {}", e))?;
        for agv in agvs {
            upsert_agv(&tx, agv).await?;
        }
        tx.commit()
            .await
            .map_err(|e| format!("Failed to commit provisioning: {}", e))?;
        tracing::info!("Provisioned layout {} with {} AGVs", layout.name, agvs.len());
        Ok(true)
    }
}

async fn upsert_agv<C: GenericClient + Sync>(client: &C, agv: &Agv) -> Result<(), String> {
    let state = serde_json::to_value(agv).map_err(|e| format!("Failed to serialize AGV: {}", e))?;
    let current_task = agv.current_task_id.map(|id| id.0);
    client
        .execute(
            UPSERT_AGV,
            &[
                &agv.id.as_str(),
                &(agv.version as i64),
                &agv.status.as_str(),
                &agv.battery,
                &(agv.cell.row as i32),
                &(agv.cell.bay as i32),
                &current_task,
                &state,
                &agv.updated_at,
            ],
        )
        .await
        .map_err(|e| format!("Failed to save AGV {}: {}", agv.id, e))?;
    Ok(())
}

async fn upsert_task<C: GenericClient + Sync>(client: &C, task: &Task) -> Result<(), String> {
    let state =
        serde_json::to_value(task).map_err(|e| format!("Failed to serialize task: {}", e))?;
    let assigned = task.assigned_agv.as_ref().map(|a| a.as_str());
    client
        .execute(
            UPSERT_TASK,
            &[
                &task.id.0,
                &(task.seq as i64),
                &(task.version as i64),
                &task.kind.name(),
                &task.priority.rank(),
                &task.status.as_str(),
                &assigned,
                &state,
                &task.created_at,
            ],
        )
        .await
        .map_err(|e| format!("Failed to save task {}: {}", task.id, e))?;
    Ok(())
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn load_layout(&self) -> Result<WarehouseLayout, String> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;
        let row = client
            .query_opt("SELECT layout FROM warehouse_layout WHERE layout_id = 1", &[])
            .await
            .map_err(|e| format!("Failed to load layout: {}", e))?
            .ok_or_else(|| "No warehouse layout provisioned".to_string())?;
        serde_json::from_value(row.get(0)).map_err(|e| format!("Corrupt layout row: {}", e))
    }

    async fn load_agvs(&self) -> Result<Vec<Agv>, String> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;
        let rows = client
            .query("SELECT state FROM agvs ORDER BY agv_id", &[])
            .await
            .map_err(|e| format!("Failed to load AGVs: {}", e))?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value::<Agv>(row.get(0))
                    .map_err(|e| format!("Corrupt AGV row: {}", e))
            })
            .collect()
    }

    async fn save_task(&self, task: &Task) -> Result<(), String> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;
        upsert_task(&client, task).await
    }

    async fn save_agv(&self, agv: &Agv) -> Result<(), String> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;
        upsert_agv(&client, agv).await
    }

    async fn save_task_and_agv(&self, task: &Task, agv: &Agv) -> Result<(), String> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| format!("Failed to begin transaction: {}", e))?;
        upsert_task(&tx, task).await?;
        upsert_agv(&tx, agv).await?;
        tx.commit()
            .await
            .map_err(|e| format!("Failed to commit task {} with AGV {}: {}", task.id, agv.id, e))
    }
}
