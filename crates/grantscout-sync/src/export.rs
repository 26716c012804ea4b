//! JSON export of normalised records (dry-run output).

use std::path::Path;

use grantscout_core::NormalisedOpportunity;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PipelineError;

/// Keys every exported object must carry with a non-null value.
pub const REQUIRED_FIELDS: &[&str] = &[
    "record_type",
    "title",
    "funder_name",
    "funding_type",
    "description_short",
    "industry_tags",
    "province_tags",
    "eligibility_bullets",
    "is_rolling",
    "required_documents_bullets",
    "application_steps",
    "official_apply_url",
    "source_url",
    "source_name",
    "last_verified_date",
    "status",
    "raw_content_hash",
];

/// Wire shape: absent optionals serialise as explicit `null`, dates as
/// ISO-8601, amounts as numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub record_type: String,
    pub title: String,
    pub funder_name: String,
    pub funder_type: String,
    pub funding_type: String,
    pub description_short: String,
    pub industry_tags: Vec<String>,
    pub province_tags: Vec<String>,
    pub business_stage: String,
    pub eligibility_bullets: Vec<String>,
    pub funding_amount_min: Option<f64>,
    pub funding_amount_max: Option<f64>,
    pub deadline_date: Option<String>,
    pub is_rolling: bool,
    pub required_documents_bullets: Vec<String>,
    pub application_steps: Vec<String>,
    pub official_apply_url: String,
    pub source_url: String,
    pub source_name: String,
    pub last_verified_date: String,
    pub status: String,
    pub raw_content_hash: String,
}

impl From<&NormalisedOpportunity> for ExportRecord {
    fn from(r: &NormalisedOpportunity) -> Self {
        Self {
            record_type: r.record_type.as_str().to_string(),
            title: r.title.clone(),
            funder_name: r.funder_name.clone(),
            funder_type: r.funder_type.as_str().to_string(),
            funding_type: r.funding_type.as_str().to_string(),
            description_short: r.description_short.clone(),
            industry_tags: r.industry_tags.clone(),
            province_tags: r.province_tags.clone(),
            business_stage: r.business_stage.as_str().to_string(),
            eligibility_bullets: r.eligibility_bullets.clone(),
            funding_amount_min: r.funding_amount_min.and_then(|d| d.to_f64()),
            funding_amount_max: r.funding_amount_max.and_then(|d| d.to_f64()),
            deadline_date: r.deadline_date.map(|d| d.format("%Y-%m-%d").to_string()),
            is_rolling: r.is_rolling,
            required_documents_bullets: r.required_documents_bullets.clone(),
            application_steps: r.application_steps.clone(),
            official_apply_url: r.official_apply_url.clone(),
            source_url: r.source_url.clone(),
            source_name: r.source_name.clone(),
            last_verified_date: r.last_verified_date.format("%Y-%m-%d").to_string(),
            status: r.status.as_str().to_string(),
            raw_content_hash: r.raw_content_hash.clone(),
        }
    }
}

/// Names of required keys that are missing or null in one exported object.
pub fn missing_required(value: &Value) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|key| value.get(key).map_or(true, Value::is_null))
        .collect()
}

pub fn to_json(records: &[NormalisedOpportunity]) -> Result<String, PipelineError> {
    let exported: Vec<ExportRecord> = records.iter().map(ExportRecord::from).collect();
    let value = serde_json::to_value(&exported).map_err(|e| PipelineError::Export(e.to_string()))?;
    if let Some(items) = value.as_array() {
        for (index, item) in items.iter().enumerate() {
            let missing = missing_required(item);
            if !missing.is_empty() {
                return Err(PipelineError::Export(format!(
                    "record {index} is missing {}",
                    missing.join(", ")
                )));
            }
        }
    }
    serde_json::to_string_pretty(&value).map_err(|e| PipelineError::Export(e.to_string()))
}

pub async fn write_json(path: &Path, records: &[NormalisedOpportunity]) -> Result<(), PipelineError> {
    let json = to_json(records)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| PipelineError::Export(format!("writing {}: {e}", path.display())))
}
