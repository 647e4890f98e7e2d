//! # Event Log / Tracker
//!
//! The append-only progress log over the `imports` table, and the claim
//! primitive that binds an order to exactly one worker.
//!
//! Every stage transition is a new event row sharing the order's uuid; the
//! maximum-`(timestamp, id)` row is the authoritative current stage. The
//! claim uses `FOR UPDATE SKIP LOCKED` on the candidate row plus a
//! fresh-snapshot recheck inside the claiming transaction, so two
//! concurrent pollers never claim the same order.

mod retry;

pub use retry::with_retries;

use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{AdiError, Result};
use crate::models::{NewOrder, OrderRecord, PreprocessingSpec};
use crate::state_machine::Stage;

/// Columns of an `imports` event row, in select order.
const ORDER_COLUMNS: &str = "id, uuid, stage, group_name, user_name, destination_id, \
     destination_type, files, file_names, error_message, timestamp, preprocessing_id";

/// How many stale-candidate rechecks a single claim call tolerates before
/// reporting an empty queue.
const CLAIM_RECHECK_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct IngestTracker {
    pool: PgPool,
}

impl IngestTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Atomically claim the oldest pending order: select it under
    /// `FOR UPDATE SKIP LOCKED`, append its `Import Started` event and
    /// return it. Returns `None` when the queue is empty.
    #[instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<OrderRecord>> {
        with_retries("claim_next", || async move {
            for _ in 0..CLAIM_RECHECK_ATTEMPTS {
                let mut tx = self.pool.begin().await?;

                let Some(candidate) = self.lock_candidate(&mut tx).await? else {
                    tx.rollback().await?;
                    return Ok(None);
                };

                // The candidate row was chosen from the statement snapshot;
                // a competing claimer may have committed a newer event in
                // the meantime. This statement runs on a fresh snapshot and
                // sees any such commit.
                let current = self.current_stage_tx(&mut tx, candidate.uuid).await?;
                if current != Some(Stage::ImportPending) {
                    debug!(uuid = %candidate.uuid, "candidate went stale, rechecking");
                    tx.rollback().await?;
                    continue;
                }

                let claimed = self
                    .append_event_tx(&mut tx, &candidate, Stage::ImportStarted, None)
                    .await?;
                tx.commit().await?;

                info!(uuid = %claimed.uuid, "order claimed");
                return Ok(Some(claimed));
            }
            Ok(None)
        })
        .await
    }

    /// Append a progress event for `uuid`. Transitions that violate the
    /// stage machine are rejected.
    #[instrument(skip(self, message))]
    pub async fn record(
        &self,
        uuid: Uuid,
        stage: Stage,
        message: Option<&str>,
    ) -> Result<OrderRecord> {
        with_retries("record", || async move {
            let mut tx = self.pool.begin().await?;

            let latest = self.lock_latest(&mut tx, uuid).await?.ok_or_else(|| {
                AdiError::StageTransition {
                    uuid,
                    from: "<no events>".to_string(),
                    to: stage.to_string(),
                }
            })?;

            // The lock serializes competing writers, but the locked row may
            // no longer be the newest event by the time we hold it; this
            // statement runs on a fresh snapshot and sees any concurrent
            // commit.
            let from = self
                .current_stage_tx(&mut tx, uuid)
                .await?
                .ok_or_else(|| AdiError::StageTransition {
                    uuid,
                    from: "<no events>".to_string(),
                    to: stage.to_string(),
                })?;
            if !from.can_transition_to(stage) {
                return Err(AdiError::StageTransition {
                    uuid,
                    from: from.to_string(),
                    to: stage.to_string(),
                });
            }

            let event = self.append_event_tx(&mut tx, &latest, stage, message).await?;
            tx.commit().await?;

            debug!(uuid = %uuid, stage = %stage, "event recorded");
            Ok(event)
        })
        .await
    }

    /// Current stage for `uuid`, or `None` when no events exist.
    pub async fn current_stage(&self, uuid: Uuid) -> Result<Option<Stage>> {
        let stage: Option<String> = sqlx::query_scalar(
            "SELECT stage FROM imports WHERE uuid = $1 ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        stage
            .map(|s| {
                s.parse()
                    .map_err(|e| AdiError::Gateway(format!("corrupt stage column: {e}")))
            })
            .transpose()
    }

    /// Every uuid whose current stage is `Import Started`. Used only by
    /// startup recovery.
    pub async fn list_dangling(&self) -> Result<Vec<Uuid>> {
        let uuids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT uuid FROM (
                 SELECT DISTINCT ON (uuid) uuid, stage
                 FROM imports
                 ORDER BY uuid, timestamp DESC, id DESC
             ) latest
             WHERE stage = $1
             ORDER BY uuid",
        )
        .bind(Stage::ImportStarted.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(uuids)
    }

    /// Load the preprocessing configuration referenced by an order row.
    pub async fn load_preprocessing(&self, id: i64) -> Result<Option<PreprocessingSpec>> {
        let spec = sqlx::query_as::<_, PreprocessingSpec>(
            "SELECT id, container, input_file, output_folder, alt_output_folder, extra_params
             FROM imports_preprocessing WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(spec)
    }

    /// Producer-side append at `Import Pending`, creating the linked
    /// preprocessing row when present. Backs tests and operator tooling;
    /// the production producer writes the same shape from outside.
    pub async fn insert_new_order(&self, order: &NewOrder) -> Result<OrderRecord> {
        with_retries("insert_new_order", || async move {
            let mut tx = self.pool.begin().await?;

            let preprocessing_id = match &order.preprocessing {
                Some(pre) => {
                    let id: i64 = sqlx::query_scalar(
                        "INSERT INTO imports_preprocessing
                             (container, input_file, output_folder, alt_output_folder, extra_params)
                         VALUES ($1, $2, $3, $4, $5)
                         RETURNING id",
                    )
                    .bind(&pre.container)
                    .bind(&pre.input_file)
                    .bind(&pre.output_folder)
                    .bind(&pre.alt_output_folder)
                    .bind(pre.extra_params.clone().map(sqlx::types::Json))
                    .fetch_one(&mut *tx)
                    .await?;
                    Some(id)
                }
                None => None,
            };

            let record = sqlx::query_as::<_, OrderRecord>(&format!(
                "INSERT INTO imports
                     (uuid, stage, group_name, user_name, destination_id, destination_type,
                      files, file_names, preprocessing_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING {ORDER_COLUMNS}"
            ))
            .bind(order.uuid)
            .bind(Stage::ImportPending.to_string())
            .bind(&order.group_name)
            .bind(&order.user_name)
            .bind(&order.destination_id)
            .bind(&order.destination_type)
            .bind(sqlx::types::Json(order.files.clone()))
            .bind(order.file_names.clone().map(sqlx::types::Json))
            .bind(preprocessing_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            info!(uuid = %record.uuid, "new order enqueued");
            Ok(record)
        })
        .await
    }

    /// Oldest event row that is the latest row of a pending uuid, locked
    /// with `SKIP LOCKED` so competing claimers fall through to the next
    /// candidate. FIFO by producer timestamp, tie-broken by uuid.
    async fn lock_candidate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<OrderRecord>> {
        let row = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {columns} FROM imports i
             WHERE i.stage = $1
               AND NOT EXISTS (
                   SELECT 1 FROM imports later
                   WHERE later.uuid = i.uuid
                     AND (later.timestamp, later.id) > (i.timestamp, i.id)
               )
             ORDER BY i.timestamp ASC, i.uuid ASC
             LIMIT 1
             FOR UPDATE OF i SKIP LOCKED",
            columns = column_list("i")
        ))
        .bind(Stage::ImportPending.to_string())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    /// Latest event row for `uuid`, locked to serialise competing writers.
    async fn lock_latest(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        uuid: Uuid,
    ) -> Result<Option<OrderRecord>> {
        let row = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {ORDER_COLUMNS} FROM imports
             WHERE uuid = $1
             ORDER BY timestamp DESC, id DESC
             LIMIT 1
             FOR UPDATE"
        ))
        .bind(uuid)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn current_stage_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        uuid: Uuid,
    ) -> Result<Option<Stage>> {
        let stage: Option<String> = sqlx::query_scalar(
            "SELECT stage FROM imports WHERE uuid = $1 ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(uuid)
        .fetch_optional(&mut **tx)
        .await?;

        stage
            .map(|s| {
                s.parse()
                    .map_err(|e| AdiError::Gateway(format!("corrupt stage column: {e}")))
            })
            .transpose()
    }

    /// Append a new event row copying the order payload from `base`.
    async fn append_event_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        base: &OrderRecord,
        stage: Stage,
        message: Option<&str>,
    ) -> Result<OrderRecord> {
        let row = sqlx::query_as::<_, OrderRecord>(&format!(
            "INSERT INTO imports
                 (uuid, stage, group_name, user_name, destination_id, destination_type,
                  files, file_names, error_message, preprocessing_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(base.uuid)
        .bind(stage.to_string())
        .bind(&base.group_name)
        .bind(&base.user_name)
        .bind(&base.destination_id)
        .bind(&base.destination_type)
        .bind(&base.files)
        .bind(&base.file_names)
        .bind(message)
        .bind(base.preprocessing_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }
}

fn column_list(alias: &str) -> String {
    ORDER_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}
