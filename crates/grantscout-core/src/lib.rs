//! Core domain model shared by every GrantScout pipeline stage.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grantscout-core";

/// Upper bound for `NormalisedOpportunity::description_short`, in characters.
pub const DESCRIPTION_MAX_CHARS: usize = 300;

/// Organisation category of an approved source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    Government,
    Provincial,
    Seta,
    Corporate,
    International,
}

impl SourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Government => "government",
            Self::Provincial => "provincial",
            Self::Seta => "seta",
            Self::Corporate => "corporate",
            Self::International => "international",
        }
    }
}

/// Extraction hints for the generic HTML adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHints {
    pub funder_name: Option<String>,
    pub funder_type: Option<String>,
    pub funding_type: Option<String>,
    pub business_stage: Option<String>,
    #[serde(default)]
    pub provinces: Vec<String>,
    #[serde(default)]
    pub industries: Vec<String>,
    /// `|`-separated href keywords; when set, seed pages are listings.
    pub link_pattern: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_seconds() -> f64 {
    2.0
}

/// One approved origin of opportunities, as configured in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub source_name: String,
    pub base_url: String,
    #[serde(default)]
    pub scrape_urls: Vec<String>,
    pub category: SourceCategory,
    pub adapter: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_rate_limit_seconds")]
    pub rate_limit_seconds: f64,
    #[serde(default)]
    pub hints: SourceHints,
}

impl SourceConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::try_from_secs_f64(self.rate_limit_seconds).unwrap_or_default()
    }
}

/// Deadline-bound opportunity vs. always-open product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    FundingOpportunity,
    FundingProduct,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FundingOpportunity => "FundingOpportunity",
            Self::FundingProduct => "FundingProduct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunderType {
    Gov,
    #[serde(rename = "DFI")]
    Dfi,
    Private,
    #[serde(rename = "NGO-Donor")]
    NgoDonor,
    Mixed,
}

impl FunderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gov => "Gov",
            Self::Dfi => "DFI",
            Self::Private => "Private",
            Self::NgoDonor => "NGO-Donor",
            Self::Mixed => "Mixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingType {
    Grant,
    Loan,
    Equity,
    Mixed,
    CompetitionPrize,
}

impl FundingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "Grant",
            Self::Loan => "Loan",
            Self::Equity => "Equity",
            Self::Mixed => "Mixed",
            Self::CompetitionPrize => "CompetitionPrize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusinessStage {
    Startup,
    #[serde(rename = "SME")]
    Sme,
    Established,
    Any,
}

impl BusinessStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "Startup",
            Self::Sme => "SME",
            Self::Established => "Established",
            Self::Any => "Any",
        }
    }
}

/// Lifecycle status. Only the status manager assigns this on a normalised record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    Active,
    Expired,
    DraftNeedsReview,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Expired => "Expired",
            Self::DraftNeedsReview => "DraftNeedsReview",
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unstructured adapter output for one scraped page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOpportunity {
    pub title: Option<String>,
    pub funder_name: Option<String>,
    pub funder_type: Option<String>,
    pub funding_type: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub provinces: Vec<String>,
    pub business_stage: Option<String>,
    #[serde(default)]
    pub eligibility: Vec<String>,
    pub funding_amount_min: Option<String>,
    pub funding_amount_max: Option<String>,
    pub deadline: Option<String>,
    #[serde(default)]
    pub is_rolling: bool,
    #[serde(default)]
    pub required_documents: Vec<String>,
    #[serde(default)]
    pub application_steps: Vec<String>,
    pub apply_url: Option<String>,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub raw_content: String,
}

/// Canonical funding record ready for compliance, dedup, status and import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalisedOpportunity {
    pub record_type: RecordType,
    pub title: String,
    pub funder_name: String,
    pub funder_type: FunderType,
    pub funding_type: FundingType,
    pub description_short: String,
    pub industry_tags: Vec<String>,
    pub province_tags: Vec<String>,
    pub business_stage: BusinessStage,
    pub eligibility_bullets: Vec<String>,
    pub funding_amount_min: Option<Decimal>,
    pub funding_amount_max: Option<Decimal>,
    pub deadline_date: Option<NaiveDate>,
    pub is_rolling: bool,
    pub required_documents_bullets: Vec<String>,
    pub application_steps: Vec<String>,
    pub official_apply_url: String,
    pub source_url: String,
    pub source_name: String,
    pub last_verified_date: NaiveDate,
    pub status: OpportunityStatus,
    pub raw_content_hash: String,
    pub validation_issues: Vec<String>,
}

impl NormalisedOpportunity {
    /// Names of required fields that are empty. `funding_type` always carries a
    /// value (normalisation substitutes a default), so it never appears here.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.title.trim().is_empty() {
            missing.push("title");
        }
        if self.funder_name.trim().is_empty() {
            missing.push("funder_name");
        }
        if self.official_apply_url.trim().is_empty() {
            missing.push("official_apply_url");
        }
        if self.source_url.trim().is_empty() {
            missing.push("source_url");
        }
        missing
    }
}

/// Outcome of the trust/safety policy check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub is_compliant: bool,
    pub issues: Vec<String>,
    pub rejection_reason: Option<String>,
}

impl ComplianceResult {
    pub fn from_parts(issues: Vec<String>, rejection_reason: Option<String>) -> Self {
        Self {
            is_compliant: rejection_reason.is_none(),
            issues,
            rejection_reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    SourceUrl,
    ApplyUrl,
    FuzzyTitle,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceUrl => "source_url",
            Self::ApplyUrl => "apply_url",
            Self::FuzzyTitle => "fuzzy_title",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    pub is_duplicate: bool,
    /// Id of the stored record this candidate duplicates, exactly as the store reported it.
    pub existing_record_id: Option<Uuid>,
    pub match_type: Option<MatchType>,
    pub similarity_score: Option<f64>,
}

impl DeduplicationResult {
    pub fn not_duplicate() -> Self {
        Self::default()
    }

    pub fn matched(existing_record_id: Uuid, match_type: MatchType, similarity_score: f64) -> Self {
        Self {
            is_duplicate: true,
            existing_record_id: Some(existing_record_id),
            match_type: Some(match_type),
            similarity_score: Some(similarity_score),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportAction {
    Created,
    Updated,
    Skipped,
}

impl ImportAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub success: bool,
    pub action: ImportAction,
    pub record_id: Option<Uuid>,
    pub error: Option<String>,
}

impl ImportResult {
    pub fn created(record_id: Uuid) -> Self {
        Self {
            success: true,
            action: ImportAction::Created,
            record_id: Some(record_id),
            error: None,
        }
    }

    pub fn updated(record_id: Uuid) -> Self {
        Self {
            success: true,
            action: ImportAction::Updated,
            record_id: Some(record_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            action: ImportAction::Skipped,
            record_id: None,
            error: Some(error.into()),
        }
    }
}

/// Projection of a stored record used for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRecord {
    pub id: Uuid,
    pub apply_url: String,
    pub source_url: String,
    pub title: String,
    pub funder_name: String,
}

/// Persistence capability consumed by the pipeline.
///
/// `import_record` must apply the record, its province/industry tags and an
/// audit entry as one atomic unit. Failures are reported through
/// `ImportResult::failed` rather than an `Err`, so a bad record never aborts a
/// source.
#[async_trait]
pub trait Importer: Send + Sync {
    async fn import_record(
        &self,
        record: &NormalisedOpportunity,
        existing_id: Option<Uuid>,
    ) -> ImportResult;

    async fn list_existing_records(&self) -> anyhow::Result<Vec<ExistingRecord>>;
}

/// Lifecycle fields of a stored record, enough to re-evaluate its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLifecycle {
    pub id: Uuid,
    pub title: String,
    pub status: OpportunityStatus,
    pub deadline_date: Option<NaiveDate>,
    pub is_rolling: bool,
    pub last_verified_date: NaiveDate,
}

/// Status maintenance over already-stored records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn list_lifecycles(&self) -> anyhow::Result<Vec<StoredLifecycle>>;

    /// Moves one record to `status` and writes a `status_refreshed` audit
    /// entry carrying `reason`, as one atomic unit.
    async fn update_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
        reason: &str,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NormalisedOpportunity {
        NormalisedOpportunity {
            record_type: RecordType::FundingOpportunity,
            title: "Youth Development Grant Programme".into(),
            funder_name: "NYDA".into(),
            funder_type: FunderType::Gov,
            funding_type: FundingType::Grant,
            description_short: String::new(),
            industry_tags: vec![],
            province_tags: vec!["National".into()],
            business_stage: BusinessStage::Any,
            eligibility_bullets: vec![],
            funding_amount_min: None,
            funding_amount_max: None,
            deadline_date: None,
            is_rolling: false,
            required_documents_bullets: vec![],
            application_steps: vec![],
            official_apply_url: "https://nyda.gov.za/apply".into(),
            source_url: "https://nyda.gov.za/grant".into(),
            source_name: "NYDA".into(),
            last_verified_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            status: OpportunityStatus::DraftNeedsReview,
            raw_content_hash: String::new(),
            validation_issues: vec![],
        }
    }

    #[test]
    fn enum_vocabularies_serialize_to_canonical_strings() {
        assert_eq!(serde_json::to_string(&FunderType::NgoDonor).unwrap(), "\"NGO-Donor\"");
        assert_eq!(serde_json::to_string(&FunderType::Dfi).unwrap(), "\"DFI\"");
        assert_eq!(serde_json::to_string(&BusinessStage::Sme).unwrap(), "\"SME\"");
        assert_eq!(
            serde_json::to_string(&OpportunityStatus::DraftNeedsReview).unwrap(),
            "\"DraftNeedsReview\""
        );
        assert_eq!(serde_json::to_string(&MatchType::FuzzyTitle).unwrap(), "\"fuzzy_title\"");
        assert_eq!(FundingType::CompetitionPrize.as_str(), "CompetitionPrize");
    }

    #[test]
    fn missing_required_fields_reports_blank_values() {
        let mut r = record();
        assert!(r.missing_required_fields().is_empty());
        r.title = "   ".into();
        r.official_apply_url.clear();
        assert_eq!(r.missing_required_fields(), vec!["title", "official_apply_url"]);
    }

    #[test]
    fn source_config_defaults_apply() {
        let source: SourceConfig = serde_json::from_value(serde_json::json!({
            "source_id": "nyda",
            "source_name": "NYDA",
            "base_url": "https://www.nyda.gov.za",
            "category": "government",
            "adapter": "nyda"
        }))
        .unwrap();
        assert!(source.is_active);
        assert!(source.scrape_urls.is_empty());
        assert_eq!(source.rate_limit(), Duration::from_secs(2));
        assert_eq!(source.hints, SourceHints::default());
        assert_eq!(source.category.as_str(), "government");
    }

    #[test]
    fn compliance_result_is_compliant_only_without_rejection() {
        let ok = ComplianceResult::from_parts(vec!["Missing required field: title".into()], None);
        assert!(ok.is_compliant);
        let rejected = ComplianceResult::from_parts(vec![], Some("Payment required to apply".into()));
        assert!(!rejected.is_compliant);
    }
}
