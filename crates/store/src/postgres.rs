use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ArrangementId, BillingItemId, PayerId, QueueItemId};
use domain::{
    BillingArrangement, IdempotencyRecord, IdempotencyStatus, License, LicenseKey, LicenseStatus,
    Money, PaymentRecord, PurchaseEvent, PurchaseKind, QueueItem, QueueStatus, QueueTask,
    UnitOfWork,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::store::{ClaimOutcome, RecordStore};
use crate::{Result, StoreError};

const LICENSE_COLUMNS: &str = "license_key, payer_id, billing_arrangement_id, billing_item_id, \
     bound_resource_id, status, purchase_kind, reference, unit_index, created_at, updated_at";

const QUEUE_COLUMNS: &str = "queue_id, task, payer_id, billing_arrangement_id, license_key, \
     price_ref, unit_amount_cents, currency, charge_ref, purchase_total_cents, purchase_units, \
     purchase_kind, billing_item_id, bound_resource_id, reference, unit_index, status, attempts, \
     next_retry_at, lease_expires_at, error_trail, refund_id, created_at, processed_at";

const PAYMENT_COLUMNS: &str =
    "payment_id, reference, payer_id, arrangement_id, amount_cents, currency, charge_ref, status, created_at";

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Creates a new PostgreSQL record store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_idempotency(row: PgRow) -> Result<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            operation_key: row.try_get("operation_key")?,
            status: IdempotencyStatus::parse(row.try_get::<&str, _>("status")?)?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn row_to_license(row: PgRow) -> Result<License> {
        Ok(License {
            license_key: LicenseKey::from_stored(row.try_get::<String, _>("license_key")?),
            payer_id: PayerId::new(row.try_get::<String, _>("payer_id")?),
            billing_arrangement_id: ArrangementId::new(
                row.try_get::<String, _>("billing_arrangement_id")?,
            ),
            billing_item_id: BillingItemId::new(row.try_get::<String, _>("billing_item_id")?),
            bound_resource_id: row.try_get("bound_resource_id")?,
            status: LicenseStatus::parse(row.try_get::<&str, _>("status")?)?,
            purchase_kind: PurchaseKind::parse(row.try_get::<&str, _>("purchase_kind")?)?,
            reference: row.try_get("reference")?,
            unit_index: row.try_get::<i32, _>("unit_index")? as u32,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_arrangement(row: PgRow) -> Result<BillingArrangement> {
        Ok(BillingArrangement {
            arrangement_id: ArrangementId::new(row.try_get::<String, _>("arrangement_id")?),
            payer_id: PayerId::new(row.try_get::<String, _>("payer_id")?),
            status: row.try_get("status")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        })
    }

    fn row_to_payment(row: PgRow) -> Result<PaymentRecord> {
        Ok(PaymentRecord {
            payment_id: row.try_get("payment_id")?,
            reference: row.try_get("reference")?,
            payer_id: PayerId::new(row.try_get::<String, _>("payer_id")?),
            arrangement_id: row
                .try_get::<Option<String>, _>("arrangement_id")?
                .map(ArrangementId::new),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            currency: row.try_get("currency")?,
            charge_ref: row.try_get("charge_ref")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_queue_item(row: PgRow) -> Result<QueueItem> {
        let trail: serde_json::Value = row.try_get("error_trail")?;
        let error_trail: Vec<String> = serde_json::from_value(trail)?;

        Ok(QueueItem {
            queue_id: QueueItemId::from_uuid(row.try_get::<Uuid, _>("queue_id")?),
            task: QueueTask::parse(row.try_get::<&str, _>("task")?)?,
            unit: UnitOfWork {
                payer_id: PayerId::new(row.try_get::<String, _>("payer_id")?),
                billing_arrangement_id: row
                    .try_get::<Option<String>, _>("billing_arrangement_id")?
                    .map(ArrangementId::new),
                license_key: LicenseKey::from_stored(row.try_get::<String, _>("license_key")?),
                price_ref: row.try_get("price_ref")?,
                unit_amount: Money::from_cents(row.try_get("unit_amount_cents")?),
                currency: row.try_get("currency")?,
                charge_ref: row.try_get("charge_ref")?,
                purchase_total: Money::from_cents(row.try_get("purchase_total_cents")?),
                purchase_units: row.try_get::<i32, _>("purchase_units")? as u32,
                purchase_kind: PurchaseKind::parse(row.try_get::<&str, _>("purchase_kind")?)?,
                billing_item_id: row
                    .try_get::<Option<String>, _>("billing_item_id")?
                    .map(BillingItemId::new),
                bound_resource_id: row.try_get("bound_resource_id")?,
                reference: row.try_get("reference")?,
                unit_index: row.try_get::<i32, _>("unit_index")? as u32,
            },
            status: QueueStatus::parse(row.try_get::<&str, _>("status")?)?,
            attempts: row.try_get::<i32, _>("attempts")? as u32,
            next_retry_at: row.try_get("next_retry_at")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            error_trail,
            refund_id: row.try_get("refund_id")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    async fn fetch_queue_items(&self, sql: &str, bind: &str) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(sql).bind(bind).fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_queue_item).collect()
    }
}

fn map_unique_violation(entity: &'static str, key: String) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict { entity, key }
        }
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn record_event(&self, event: &PurchaseEvent) -> Result<bool> {
        let payload = serde_json::to_value(event)?;
        let result = sqlx::query(
            r#"
            INSERT INTO purchase_events
                (event_id, event_type, occurred_at, payer_id, billing_arrangement_id, amount_cents, currency, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(event.event_type.as_str())
        .bind(event.occurred_at)
        .bind(event.payer_id.as_str())
        .bind(event.billing_arrangement_id.as_ref().map(|a| a.as_str()))
        .bind(event.amount.cents())
        .bind(&event.currency)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_operation(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO idempotency_records (operation_key, status, result, created_at, expires_at)
            VALUES ($1, 'pending', NULL, $2, $3)
            ON CONFLICT (operation_key) DO UPDATE SET
                status = 'pending',
                result = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_records.status = 'failed'
               OR idempotency_records.expires_at <= $4
            RETURNING operation_key
            "#,
        )
        .bind(&record.operation_key)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let row = sqlx::query(
            r#"
            SELECT operation_key, status, result, created_at, expires_at
            FROM idempotency_records
            WHERE operation_key = $1
            "#,
        )
        .bind(&record.operation_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(ClaimOutcome::Existing(Self::row_to_idempotency(row)?))
    }

    async fn complete_operation(&self, key: &str, result: serde_json::Value) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET status = 'completed', result = $2 WHERE operation_key = $1",
        )
        .bind(key)
        .bind(result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "idempotency record",
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn fail_operation(&self, key: &str, reason: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET status = 'failed', result = $2 WHERE operation_key = $1",
        )
        .bind(key)
        .bind(serde_json::json!({ "error": reason }))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "idempotency record",
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn license_exists(&self, key: &LicenseKey) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM licenses WHERE license_key = $1)")
                .bind(key.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_license(&self, license: &License) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO licenses
                (license_key, payer_id, billing_arrangement_id, billing_item_id, bound_resource_id,
                 status, purchase_kind, reference, unit_index, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(license.license_key.as_str())
        .bind(license.payer_id.as_str())
        .bind(license.billing_arrangement_id.as_str())
        .bind(license.billing_item_id.as_str())
        .bind(&license.bound_resource_id)
        .bind(license.status.as_str())
        .bind(license.purchase_kind.as_str())
        .bind(&license.reference)
        .bind(license.unit_index as i32)
        .bind(license.created_at)
        .bind(license.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation(
            "license",
            license.license_key.to_string(),
        ))?;

        Ok(())
    }

    async fn get_license(&self, key: &LicenseKey) -> Result<Option<License>> {
        let row = sqlx::query(&format!(
            "SELECT {LICENSE_COLUMNS} FROM licenses WHERE license_key = $1"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_license).transpose()
    }

    async fn find_license_for_unit(
        &self,
        reference: &str,
        unit_index: u32,
    ) -> Result<Option<License>> {
        let row = sqlx::query(&format!(
            "SELECT {LICENSE_COLUMNS} FROM licenses WHERE reference = $1 AND unit_index = $2"
        ))
        .bind(reference)
        .bind(unit_index as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_license).transpose()
    }

    async fn update_license(&self, license: &License) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE licenses
            SET status = $2, bound_resource_id = $3, updated_at = $4
            WHERE license_key = $1
            "#,
        )
        .bind(license.license_key.as_str())
        .bind(license.status.as_str())
        .bind(&license.bound_resource_id)
        .bind(license.updated_at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "license",
                key: license.license_key.to_string(),
            });
        }
        Ok(())
    }

    async fn licenses_for_payer(&self, payer_id: &PayerId) -> Result<Vec<License>> {
        let rows = sqlx::query(&format!(
            "SELECT {LICENSE_COLUMNS} FROM licenses WHERE payer_id = $1 ORDER BY created_at ASC, unit_index ASC"
        ))
        .bind(payer_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_license).collect()
    }

    async fn upsert_arrangement(&self, arrangement: &BillingArrangement) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_arrangements
                (arrangement_id, payer_id, status, current_period_start, current_period_end, cancel_at_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (arrangement_id) DO UPDATE SET
                payer_id = EXCLUDED.payer_id,
                status = EXCLUDED.status,
                current_period_start = COALESCE(EXCLUDED.current_period_start, billing_arrangements.current_period_start),
                current_period_end = COALESCE(EXCLUDED.current_period_end, billing_arrangements.current_period_end),
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = NOW()
            "#,
        )
        .bind(arrangement.arrangement_id.as_str())
        .bind(arrangement.payer_id.as_str())
        .bind(&arrangement.status)
        .bind(arrangement.current_period_start)
        .bind(arrangement.current_period_end)
        .bind(arrangement.cancel_at_period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_arrangement(&self, id: &ArrangementId) -> Result<Option<BillingArrangement>> {
        let row = sqlx::query(
            r#"
            SELECT arrangement_id, payer_id, status, current_period_start, current_period_end, cancel_at_period_end
            FROM billing_arrangements
            WHERE arrangement_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_arrangement).transpose()
    }

    async fn append_payment(&self, payment: &PaymentRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO payment_records ({PAYMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(payment.payment_id)
        .bind(&payment.reference)
        .bind(payment.payer_id.as_str())
        .bind(payment.arrangement_id.as_ref().map(|a| a.as_str()))
        .bind(payment.amount.cents())
        .bind(&payment.currency)
        .bind(&payment.charge_ref)
        .bind(&payment.status)
        .bind(payment.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation(
            "payment record",
            payment.reference.clone(),
        ))?;

        Ok(())
    }

    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn payments_for_payer(&self, payer_id: &PayerId) -> Result<Vec<PaymentRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records \
             WHERE payer_id = $1 ORDER BY created_at ASC"
        ))
        .bind(payer_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_payment).collect()
    }

    async fn enqueue(&self, items: &[QueueItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for item in items {
            let unit = &item.unit;
            sqlx::query(&format!(
                "INSERT INTO provisioning_queue ({QUEUE_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)"
            ))
            .bind(item.queue_id.as_uuid())
            .bind(item.task.as_str())
            .bind(unit.payer_id.as_str())
            .bind(unit.billing_arrangement_id.as_ref().map(|a| a.as_str()))
            .bind(unit.license_key.as_str())
            .bind(&unit.price_ref)
            .bind(unit.unit_amount.cents())
            .bind(&unit.currency)
            .bind(&unit.charge_ref)
            .bind(unit.purchase_total.cents())
            .bind(unit.purchase_units as i32)
            .bind(unit.purchase_kind.as_str())
            .bind(unit.billing_item_id.as_ref().map(|b| b.as_str()))
            .bind(&unit.bound_resource_id)
            .bind(&unit.reference)
            .bind(unit.unit_index as i32)
            .bind(item.status.as_str())
            .bind(item.attempts as i32)
            .bind(item.next_retry_at)
            .bind(item.lease_expires_at)
            .bind(serde_json::to_value(&item.error_trail)?)
            .bind(&item.refund_id)
            .bind(item.created_at)
            .bind(item.processed_at)
            .execute(&mut *tx)
            .await
            .map_err(map_unique_violation("queue item", item.queue_id.to_string()))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM provisioning_queue \
             WHERE (status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)) \
                OR (status = 'processing' AND lease_expires_at <= $1) \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_queue_item).collect()
    }

    async fn claim_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provisioning_queue
            SET status = 'processing', lease_expires_at = $3
            WHERE queue_id = $1
              AND (status = 'pending' OR (status = 'processing' AND lease_expires_at <= $2))
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .bind(lease_expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_queue_item(&self, item: &QueueItem) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE provisioning_queue
            SET status = $2, attempts = $3, next_retry_at = $4, error_trail = $5,
                refund_id = $6, processed_at = $7, billing_item_id = $8, lease_expires_at = $9
            WHERE queue_id = $1
            "#,
        )
        .bind(item.queue_id.as_uuid())
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(item.next_retry_at)
        .bind(serde_json::to_value(&item.error_trail)?)
        .bind(&item.refund_id)
        .bind(item.processed_at)
        .bind(item.unit.billing_item_id.as_ref().map(|b| b.as_str()))
        .bind(item.lease_expires_at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "queue item",
                key: item.queue_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM provisioning_queue WHERE queue_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_queue_item).transpose()
    }

    async fn queue_items_for_reference(&self, reference: &str) -> Result<Vec<QueueItem>> {
        self.fetch_queue_items(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM provisioning_queue \
                 WHERE reference = $1 OR payer_id = $1 OR billing_arrangement_id = $1 \
                 ORDER BY created_at ASC"
            ),
            reference,
        )
        .await
    }

    async fn find_queue_item_for_unit(
        &self,
        reference: &str,
        unit_index: u32,
    ) -> Result<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM provisioning_queue \
             WHERE task = 'provision' AND reference = $1 AND unit_index = $2 LIMIT 1"
        ))
        .bind(reference)
        .bind(unit_index as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_queue_item).transpose()
    }

    async fn reset_failed_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM provisioning_queue \
             WHERE queue_id = $1 AND status = 'failed' FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "failed queue item",
            key: id.to_string(),
        })?;

        let mut item = Self::row_to_queue_item(row)?;
        item.reset(now)?;

        sqlx::query(
            r#"
            UPDATE provisioning_queue
            SET status = $2, attempts = $3, next_retry_at = $4, error_trail = $5
            WHERE queue_id = $1
            "#,
        )
        .bind(item.queue_id.as_uuid())
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(item.next_retry_at)
        .bind(serde_json::to_value(&item.error_trail)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(item)
    }
}
