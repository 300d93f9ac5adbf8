// Postgres-backed StateStore implementation
//
// Every state-log row is the whole Flow document in a JSONB column plus the
// indexed fields the correlator queries on. Both tables are append-only;
// nothing here mutates a row.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use flowmq_core::{Flow, HistoryEntry, ProgressStatus, Result, StateStore, WorkflowError};

/// Postgres state store
///
/// Shares one lazily-sized pool across every caller; clone freely.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect from a database URL.
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| WorkflowError::storage(e.to_string()))?;
        debug!("storage migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_state_log(&self, flow: &Flow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flow (w_id, b_id, s_id, status, routing_key, c_chain, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(flow.flow_id)
        .bind(flow.branch_id)
        .bind(flow.step_id)
        .bind(flow.progress.status.to_string())
        .bind(&flow.progress.routing_key)
        .bind(serde_json::to_value(&flow.correlation_chain)?)
        .bind(serde_json::to_value(flow)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> WorkflowError {
    WorkflowError::storage(err.to_string())
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get_resumable_step(&self, flow_id: Uuid, step_id: Uuid) -> Result<Option<Flow>> {
        let doc: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT doc FROM flow
            WHERE w_id = $1 AND s_id = $2
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(flow_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match doc {
            Some(doc) => {
                let flow = serde_json::from_value(doc)
                    .map_err(|e| WorkflowError::storage(format!("corrupt flow document: {e}")))?;
                Ok(Some(flow))
            }
            None => Ok(None),
        }
    }

    async fn create_state_log_if_not_exist(
        &self,
        flow: &Flow,
        routing_key: &str,
        status: ProgressStatus,
    ) -> Result<()> {
        let mut clone = flow.deep_copy();
        clone.assign_branch_id();
        clone.progress.status = status;
        clone.progress.routing_key = routing_key.to_string();

        // Check and insert ride one statement; duplicate deliveries on one
        // subscription arrive sequentially.
        sqlx::query(
            r#"
            INSERT INTO flow (w_id, b_id, s_id, status, routing_key, c_chain, doc)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE NOT EXISTS (
                SELECT 1 FROM flow WHERE w_id = $1 AND s_id = $3 AND status = $4
            )
            "#,
        )
        .bind(clone.flow_id)
        .bind(clone.branch_id)
        .bind(clone.step_id)
        .bind(status.to_string())
        .bind(routing_key)
        .bind(serde_json::to_value(&clone.correlation_chain)?)
        .bind(serde_json::to_value(&clone)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn create_state_log(&self, flow: &Flow) -> Result<()> {
        self.insert_state_log(flow).await
    }

    async fn store_history_entry(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO history (entity, status, state, w_id, b_id, s_id, name)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&entry.entity)
        .bind(entry.status.map(|s| s.to_string()))
        .bind(entry.state.to_string())
        .bind(entry.flow_id)
        .bind(entry.branch_id)
        .bind(entry.step_id)
        .bind(&entry.name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn is_chains_successful(
        &self,
        flow_id: Uuid,
        step_id: Uuid,
        chain: &[String],
    ) -> Result<bool> {
        if chain.is_empty() {
            return Ok(false);
        }

        for token in chain {
            // Newest status per sibling step that carried this token.
            let statuses: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT DISTINCT ON (s_id) status
                FROM flow
                WHERE w_id = $1 AND s_id <> $2 AND c_chain @> $3::jsonb
                ORDER BY s_id, ts DESC, id DESC
                "#,
            )
            .bind(flow_id)
            .bind(step_id)
            .bind(serde_json::to_value(std::slice::from_ref(token))?)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            if statuses.is_empty() {
                return Ok(false);
            }
            let all_settled = statuses.iter().all(|status| {
                status == &ProgressStatus::Success.to_string()
                    || status == &ProgressStatus::Dropped.to_string()
            });
            if !all_settled {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_flow_shutdown(&self, flow_id: Uuid) -> Result<bool> {
        let state: Option<String> = sqlx::query_scalar(
            r#"
            SELECT state FROM history
            WHERE w_id = $1
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(state.as_deref() == Some("shutdowned"))
    }

    async fn store_shutdown_entry(&self, flow_id: Uuid, workflow_name: &str) -> Result<()> {
        self.store_history_entry(&HistoryEntry::shutdowned(flow_id, workflow_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmq_core::FlowState;

    // The chain and shutdown queries compare TEXT columns against the
    // display form of the enums; keep the two representations locked
    // together.
    #[test]
    fn test_status_display_matches_wire_form() {
        for status in [
            ProgressStatus::Success,
            ProgressStatus::Failure,
            ProgressStatus::Pending,
            ProgressStatus::Running,
            ProgressStatus::Dropped,
        ] {
            let wire = serde_json::to_value(status).unwrap();
            assert_eq!(wire, serde_json::Value::String(status.to_string()));
        }
    }

    #[test]
    fn test_state_display_matches_wire_form() {
        for state in [FlowState::Started, FlowState::Shutdowned] {
            let wire = serde_json::to_value(state).unwrap();
            assert_eq!(wire, serde_json::Value::String(state.to_string()));
        }
    }
}
