//! In-process importer used for dry runs, tests and offline scraping.

use std::collections::BTreeMap;

use async_trait::async_trait;
use grantscout_core::{
    ExistingRecord, ImportResult, Importer, NormalisedOpportunity, OpportunityStatus, StatusStore,
    StoredLifecycle,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::mapping::{changed_fields, opportunity_row, status_column, status_from_column, OpportunityRow};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredOpportunity {
    pub id: Uuid,
    pub row: OpportunityRow,
    pub industries: Vec<String>,
    pub provinces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub opportunity_id: Uuid,
    pub action: String,
    pub changes: serde_json::Value,
}

#[derive(Debug, Default)]
struct Inner {
    // Insertion order keeps `list_existing_records` deterministic.
    order: Vec<Uuid>,
    records: BTreeMap<Uuid, StoredOpportunity>,
    audit: Vec<AuditEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryImporter {
    inner: Mutex<Inner>,
}

impl MemoryImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing the audit log. Returns the new id.
    pub async fn seed(&self, record: &NormalisedOpportunity) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().await;
        inner.order.push(id);
        inner.records.insert(id, stored(id, record));
        id
    }

    pub async fn records(&self) -> Vec<StoredOpportunity> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }
}

fn stored(id: Uuid, record: &NormalisedOpportunity) -> StoredOpportunity {
    StoredOpportunity {
        id,
        row: opportunity_row(record),
        industries: record.industry_tags.clone(),
        provinces: record.province_tags.clone(),
    }
}

#[async_trait]
impl Importer for MemoryImporter {
    async fn import_record(
        &self,
        record: &NormalisedOpportunity,
        existing_id: Option<Uuid>,
    ) -> ImportResult {
        let mut inner = self.inner.lock().await;

        match existing_id {
            Some(id) => {
                let Some(current) = inner.records.get(&id) else {
                    warn!(title = %record.title, %id, "update target not found");
                    return ImportResult::failed(format!("record {id} not found"));
                };
                let next = stored(id, record);
                let fields = changed_fields(&current.row, &next.row);
                inner.records.insert(id, next);
                inner.audit.push(AuditEntry {
                    opportunity_id: id,
                    action: "updated_by_scraper".to_string(),
                    changes: json!({ "fields": fields }),
                });
                info!(title = %record.title, %id, "updated");
                ImportResult::updated(id)
            }
            None => {
                let id = Uuid::new_v4();
                inner.order.push(id);
                inner.records.insert(id, stored(id, record));
                inner.audit.push(AuditEntry {
                    opportunity_id: id,
                    action: "created_by_scraper".to_string(),
                    changes: json!({ "source": record.source_name }),
                });
                info!(title = %record.title, %id, "created");
                ImportResult::created(id)
            }
        }
    }

    async fn list_existing_records(&self) -> anyhow::Result<Vec<ExistingRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .map(|r| ExistingRecord {
                id: r.id,
                apply_url: r.row.apply_link.clone(),
                source_url: r.row.source_link.clone(),
                title: r.row.funding_name.clone(),
                funder_name: r.row.funder.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl StatusStore for MemoryImporter {
    async fn list_lifecycles(&self) -> anyhow::Result<Vec<StoredLifecycle>> {
        let inner = self.inner.lock().await;
        let mut out = Vec::with_capacity(inner.order.len());
        for r in inner.order.iter().filter_map(|id| inner.records.get(id)) {
            let Some(status) = status_from_column(&r.row.status) else {
                warn!(id = %r.id, status = %r.row.status, "unknown stored status");
                continue;
            };
            out.push(StoredLifecycle {
                id: r.id,
                title: r.row.funding_name.clone(),
                status,
                deadline_date: r.row.deadline,
                is_rolling: r.row.is_rolling,
                last_verified_date: r.row.last_verified,
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
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("record {id} not found"))?;
        let from = std::mem::replace(&mut record.row.status, status_column(status).to_string());
        inner.audit.push(AuditEntry {
            opportunity_id: id,
            action: "status_refreshed".to_string(),
            changes: json!({ "from": from, "to": status_column(status), "reason": reason }),
        });
        info!(%id, status = %status, reason, "status refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use grantscout_core::{
        BusinessStage, FunderType, FundingType, ImportAction, OpportunityStatus, RecordType,
    };

    fn record(title: &str) -> NormalisedOpportunity {
        NormalisedOpportunity {
            record_type: RecordType::FundingProduct,
            title: title.into(),
            funder_name: "Small Enterprise Development and Finance Agency".into(),
            funder_type: FunderType::Dfi,
            funding_type: FundingType::Loan,
            description_short: String::new(),
            industry_tags: vec!["Manufacturing".into()],
            province_tags: vec!["Gauteng".into()],
            business_stage: BusinessStage::Sme,
            eligibility_bullets: vec![],
            funding_amount_min: None,
            funding_amount_max: None,
            deadline_date: None,
            is_rolling: true,
            required_documents_bullets: vec![],
            application_steps: vec![],
            official_apply_url: "https://sefa.org.za/apply".into(),
            source_url: "https://sefa.org.za/products/loan".into(),
            source_name: "sefa".into(),
            last_verified_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            status: OpportunityStatus::Active,
            raw_content_hash: String::new(),
            validation_issues: vec![],
        }
    }

    #[tokio::test]
    async fn create_then_update_writes_audit_entries() {
        let importer = MemoryImporter::new();

        let created = importer.import_record(&record("Term Loan"), None).await;
        assert!(created.success);
        assert_eq!(created.action, ImportAction::Created);
        let id = created.record_id.unwrap();

        let updated = importer.import_record(&record("Term Loan Facility"), Some(id)).await;
        assert_eq!(updated.action, ImportAction::Updated);
        assert_eq!(updated.record_id, Some(id));

        let audit = importer.audit_log().await;
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].action, "created_by_scraper");
        assert_eq!(audit[0].changes, json!({ "source": "sefa" }));
        assert_eq!(audit[1].action, "updated_by_scraper");
        assert_eq!(audit[1].changes, json!({ "fields": ["funding_name"] }));

        let records = importer.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].row.funding_name, "Term Loan Facility");
        assert_eq!(records[0].provinces, vec!["Gauteng".to_string()]);
    }

    #[tokio::test]
    async fn update_of_unknown_id_fails_without_side_effects() {
        let importer = MemoryImporter::new();
        let result = importer.import_record(&record("Term Loan"), Some(Uuid::new_v4())).await;
        assert!(!result.success);
        assert_eq!(result.action, ImportAction::Skipped);
        assert!(result.error.unwrap().contains("not found"));
        assert!(importer.records().await.is_empty());
        assert!(importer.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn existing_records_project_stored_columns() {
        let importer = MemoryImporter::new();
        let id = importer.seed(&record("Bridging Loan")).await;
        let existing = importer.list_existing_records().await.unwrap();
        assert_eq!(
            existing,
            vec![ExistingRecord {
                id,
                apply_url: "https://sefa.org.za/apply".into(),
                source_url: "https://sefa.org.za/products/loan".into(),
                title: "Bridging Loan".into(),
                funder_name: "Small Enterprise Development and Finance Agency".into(),
            }]
        );
        assert!(importer.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn status_updates_are_listed_and_audited() {
        let importer = MemoryImporter::new();
        let id = importer.seed(&record("Term Loan")).await;

        let lifecycles = importer.list_lifecycles().await.unwrap();
        assert_eq!(lifecycles.len(), 1);
        assert_eq!(lifecycles[0].id, id);
        assert_eq!(lifecycles[0].status, OpportunityStatus::Active);
        assert!(lifecycles[0].is_rolling);

        importer
            .update_status(id, OpportunityStatus::DraftNeedsReview, "stale")
            .await
            .unwrap();
        assert_eq!(importer.records().await[0].row.status, "draft");
        let audit = importer.audit_log().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "status_refreshed");
        assert_eq!(audit[0].changes, json!({ "from": "active", "to": "draft", "reason": "stale" }));

        let missing = importer
            .update_status(Uuid::new_v4(), OpportunityStatus::Expired, "gone")
            .await;
        assert!(missing.is_err());
    }
}
