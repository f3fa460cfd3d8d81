use sqlx::PgPool;

use crate::db::models::GenerationLog;
use crate::db::store::StoreError;

pub async fn record_generation(pool: &PgPool, log: &GenerationLog) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO "generation_logs" (
            "callType", "status", "latencyMs", "itemCount", "errorMessage", "createdAt"
        ) VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(&log.call_type)
    .bind(log.status.as_str())
    .bind(log.latency_ms)
    .bind(log.item_count)
    .bind(&log.error_message)
    .execute(pool)
    .await?;
    Ok(())
}
