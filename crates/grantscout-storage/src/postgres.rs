//! Postgres-backed importer.

use anyhow::Context;
use async_trait::async_trait;
use grantscout_core::{
    ExistingRecord, ImportResult, Importer, NormalisedOpportunity, OpportunityStatus, StatusStore,
    StoredLifecycle,
};
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::mapping::{changed_fields, opportunity_row, status_column, status_from_column, OpportunityRow};

#[derive(Debug, Clone)]
pub struct PgImporter {
    pool: PgPool,
}

impl PgImporter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    async fn create(&self, record: &NormalisedOpportunity) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        let row = opportunity_row(record);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO funding_opportunities (
                id, funding_name, funder, funding_type, description, business_stage,
                eligibility_requirements, funding_amount, funding_amount_min, funding_amount_max,
                deadline, is_rolling, required_documents, application_steps,
                apply_link, source_link, last_verified, status, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(id)
        .bind(&row.funding_name)
        .bind(&row.funder)
        .bind(&row.funding_type)
        .bind(&row.description)
        .bind(&row.business_stage)
        .bind(Json(&row.eligibility_requirements))
        .bind(&row.funding_amount)
        .bind(row.funding_amount_min)
        .bind(row.funding_amount_max)
        .bind(row.deadline)
        .bind(row.is_rolling)
        .bind(Json(&row.required_documents))
        .bind(Json(&row.application_steps))
        .bind(&row.apply_link)
        .bind(&row.source_link)
        .bind(row.last_verified)
        .bind(&row.status)
        .bind(&row.notes)
        .execute(&mut *tx)
        .await
        .context("inserting funding opportunity")?;

        replace_tags(&mut tx, id, record).await?;
        insert_audit(&mut tx, id, "created_by_scraper", json!({ "source": record.source_name })).await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn update(&self, id: Uuid, record: &NormalisedOpportunity) -> anyhow::Result<()> {
        let row = opportunity_row(record);
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            r#"
            SELECT funding_name, funder, funding_type, description, business_stage,
                   eligibility_requirements, funding_amount, funding_amount_min, funding_amount_max,
                   deadline, is_rolling, required_documents, application_steps,
                   apply_link, source_link, last_verified, status, notes
              FROM funding_opportunities
             WHERE id = $1
               FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| format!("record {id} not found"))?;
        let fields = changed_fields(&row_from_pg(&current)?, &row);

        sqlx::query(
            r#"
            UPDATE funding_opportunities
               SET funding_name = $2,
                   funder = $3,
                   funding_type = $4,
                   description = $5,
                   business_stage = $6,
                   eligibility_requirements = $7,
                   funding_amount = $8,
                   funding_amount_min = $9,
                   funding_amount_max = $10,
                   deadline = $11,
                   is_rolling = $12,
                   required_documents = $13,
                   application_steps = $14,
                   apply_link = $15,
                   source_link = $16,
                   last_verified = $17,
                   status = $18,
                   notes = $19,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&row.funding_name)
        .bind(&row.funder)
        .bind(&row.funding_type)
        .bind(&row.description)
        .bind(&row.business_stage)
        .bind(Json(&row.eligibility_requirements))
        .bind(&row.funding_amount)
        .bind(row.funding_amount_min)
        .bind(row.funding_amount_max)
        .bind(row.deadline)
        .bind(row.is_rolling)
        .bind(Json(&row.required_documents))
        .bind(Json(&row.application_steps))
        .bind(&row.apply_link)
        .bind(&row.source_link)
        .bind(row.last_verified)
        .bind(&row.status)
        .bind(&row.notes)
        .execute(&mut *tx)
        .await
        .context("updating funding opportunity")?;

        replace_tags(&mut tx, id, record).await?;
        insert_audit(&mut tx, id, "updated_by_scraper", json!({ "fields": fields })).await?;

        tx.commit().await?;
        Ok(())
    }
}

fn row_from_pg(row: &PgRow) -> anyhow::Result<OpportunityRow> {
    let json_list = |column: &str| -> anyhow::Result<Vec<String>> {
        let value: serde_json::Value = row.try_get(column)?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    };
    Ok(OpportunityRow {
        funding_name: row.try_get("funding_name")?,
        funder: row.try_get("funder")?,
        funding_type: row.try_get("funding_type")?,
        description: row.try_get("description")?,
        business_stage: row.try_get("business_stage")?,
        eligibility_requirements: json_list("eligibility_requirements")?,
        funding_amount: row.try_get("funding_amount")?,
        funding_amount_min: row.try_get("funding_amount_min")?,
        funding_amount_max: row.try_get("funding_amount_max")?,
        deadline: row.try_get("deadline")?,
        is_rolling: row.try_get("is_rolling")?,
        required_documents: json_list("required_documents")?,
        application_steps: json_list("application_steps")?,
        apply_link: row.try_get("apply_link")?,
        source_link: row.try_get("source_link")?,
        last_verified: row.try_get("last_verified")?,
        status: row.try_get("status")?,
        notes: row.try_get("notes")?,
    })
}

async fn replace_tags(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    record: &NormalisedOpportunity,
) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM opportunity_industries WHERE opportunity_id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM opportunity_provinces WHERE opportunity_id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    for industry in &record.industry_tags {
        sqlx::query(
            "INSERT INTO opportunity_industries (opportunity_id, industry) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(industry)
        .execute(&mut **tx)
        .await?;
    }
    for province in &record.province_tags {
        sqlx::query(
            "INSERT INTO opportunity_provinces (opportunity_id, province) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(province)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_audit(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    action: &str,
    changes: serde_json::Value,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO audit_log (opportunity_id, action, changes) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(action)
        .bind(changes)
        .execute(&mut **tx)
        .await
        .context("writing audit entry")?;
    Ok(())
}

#[async_trait]
impl Importer for PgImporter {
    async fn import_record(
        &self,
        record: &NormalisedOpportunity,
        existing_id: Option<Uuid>,
    ) -> ImportResult {
        match existing_id {
            Some(id) => match self.update(id, record).await {
                Ok(()) => {
                    info!(title = %record.title, %id, "updated");
                    ImportResult::updated(id)
                }
                Err(err) => {
                    error!(title = %record.title, error = %format!("{err:#}"), "import failed");
                    ImportResult::failed(format!("{err:#}"))
                }
            },
            None => match self.create(record).await {
                Ok(id) => {
                    info!(title = %record.title, %id, "created");
                    ImportResult::created(id)
                }
                Err(err) => {
                    error!(title = %record.title, error = %format!("{err:#}"), "import failed");
                    ImportResult::failed(format!("{err:#}"))
                }
            },
        }
    }

    async fn list_existing_records(&self) -> anyhow::Result<Vec<ExistingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, apply_link, source_link, funding_name, funder
              FROM funding_opportunities
             ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing existing opportunities")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExistingRecord {
                id: row.try_get("id")?,
                apply_url: row.try_get("apply_link")?,
                source_url: row.try_get("source_link")?,
                title: row.try_get("funding_name")?,
                funder_name: row.try_get("funder")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl StatusStore for PgImporter {
    async fn list_lifecycles(&self) -> anyhow::Result<Vec<StoredLifecycle>> {
        let rows = sqlx::query(
            r#"
            SELECT id, funding_name, status, deadline, is_rolling, last_verified
              FROM funding_opportunities
             WHERE status <> 'expired'
             ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing opportunity lifecycles")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let column: String = row.try_get("status")?;
            let Some(status) = status_from_column(&column) else {
                warn!(%id, status = %column, "unknown stored status");
                continue;
            };
            out.push(StoredLifecycle {
                id,
                title: row.try_get("funding_name")?,
                status,
                deadline_date: row.try_get("deadline")?,
                is_rolling: row.try_get("is_rolling")?,
                last_verified_date: row.try_get("last_verified")?,
            });
        }
        Ok(out)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
        reason: &str,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let from: String =
            sqlx::query_scalar("SELECT status FROM funding_opportunities WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .with_context(|| format!("record {id} not found"))?;

        sqlx::query("UPDATE funding_opportunities SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status_column(status))
            .execute(&mut *tx)
            .await
            .context("updating opportunity status")?;
        insert_audit(
            &mut tx,
            id,
            "status_refreshed",
            json!({ "from": from, "to": status_column(status), "reason": reason }),
        )
        .await?;

        tx.commit().await?;
        info!(%id, status = %status, reason, "status refreshed");
        Ok(())
    }
}
