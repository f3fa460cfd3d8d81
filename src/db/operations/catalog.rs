use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::assembly::types::{
    ContentItem, ItemId, NewContentItem, Pool, QuestionPayload, SubjectId, Topic, DEFAULT_BASE_WEIGHT,
};
use crate::db::store::StoreError;

const CONTENT_ITEM_COLUMNS: &str =
    r#""id", "topicId", "pool", "content", "options", "answer", "explanation", "sourceDetail""#;

pub async fn list_topics(pool: &PgPool, subject_id: SubjectId) -> Result<Vec<Topic>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT "id", "subjectId", "name", "baseWeight", "lowSalience"
        FROM "topics"
        WHERE "subjectId" = $1
        ORDER BY "id"
        "#,
    )
    .bind(subject_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_topic).collect()
}

pub async fn list_content_items(
    pool: &PgPool,
    subject_id: SubjectId,
) -> Result<Vec<ContentItem>, StoreError> {
    let sql = format!(
        r#"SELECT {CONTENT_ITEM_COLUMNS} FROM "content_items" WHERE "subjectId" = $1 ORDER BY "id""#
    );
    let rows = sqlx::query(&sql).bind(subject_id).fetch_all(pool).await?;

    rows.iter().map(map_content_item).collect()
}

pub async fn items_by_ids(pool: &PgPool, ids: &[ItemId]) -> Result<Vec<ContentItem>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(r#"SELECT {CONTENT_ITEM_COLUMNS} FROM "content_items" WHERE "id" = ANY($1)"#);
    let rows = sqlx::query(&sql).bind(ids).fetch_all(pool).await?;

    rows.iter().map(map_content_item).collect()
}

/// Inserts all items in one transaction; either every item lands or none.
pub async fn insert_content_items(
    pool: &PgPool,
    items: &[NewContentItem],
) -> Result<Vec<ContentItem>, StoreError> {
    let mut tx = pool.begin().await?;
    let mut inserted = Vec::with_capacity(items.len());

    for item in items {
        let id: ItemId = sqlx::query_scalar(
            r#"
            INSERT INTO "content_items" (
                "subjectId", "topicId", "pool", "content", "options",
                "answer", "explanation", "sourceDetail", "createdAt"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING "id"
            "#,
        )
        .bind(item.subject_id)
        .bind(item.topic_id)
        .bind(item.pool.as_str())
        .bind(&item.payload.content)
        .bind(Json(&item.payload.options))
        .bind(&item.payload.answer)
        .bind(&item.payload.explanation)
        .bind(&item.source_detail)
        .fetch_one(&mut *tx)
        .await?;

        inserted.push(ContentItem {
            id,
            topic_id: item.topic_id,
            pool: item.pool,
            source_detail: item.source_detail.clone(),
            payload: item.payload.clone(),
        });
    }

    tx.commit().await?;
    Ok(inserted)
}

fn map_topic(row: &sqlx::postgres::PgRow) -> Result<Topic, StoreError> {
    let base_weight: Option<f64> = row.try_get("baseWeight")?;
    Ok(Topic {
        id: row.try_get("id")?,
        subject_id: row.try_get("subjectId")?,
        name: row.try_get("name")?,
        base_weight: base_weight.unwrap_or(DEFAULT_BASE_WEIGHT),
        low_salience: row.try_get("lowSalience")?,
    })
}

fn map_content_item(row: &sqlx::postgres::PgRow) -> Result<ContentItem, StoreError> {
    let pool_tag: String = row.try_get("pool")?;
    let pool = Pool::parse(&pool_tag)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown pool tag {pool_tag:?}")))?;
    let options: Json<serde_json::Value> = row.try_get("options")?;
    let explanation: Option<String> = row.try_get("explanation")?;

    Ok(ContentItem {
        id: row.try_get("id")?,
        topic_id: row.try_get("topicId")?,
        pool,
        source_detail: row.try_get("sourceDetail")?,
        payload: QuestionPayload {
            content: row.try_get("content")?,
            options: options.0,
            answer: row.try_get("answer")?,
            explanation: explanation.unwrap_or_default(),
        },
    })
}
