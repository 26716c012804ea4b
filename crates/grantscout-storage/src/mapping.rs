//! Mapping from a normalised record onto the stored `funding_opportunities` row.

use chrono::NaiveDate;
use grantscout_core::{BusinessStage, FundingType, NormalisedOpportunity, OpportunityStatus};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Column values for one stored opportunity. Tag relations are stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRow {
    pub funding_name: String,
    pub funder: String,
    pub funding_type: String,
    pub description: String,
    pub business_stage: String,
    pub eligibility_requirements: Vec<String>,
    pub funding_amount: String,
    pub funding_amount_min: Option<Decimal>,
    pub funding_amount_max: Option<Decimal>,
    pub deadline: Option<NaiveDate>,
    pub is_rolling: bool,
    pub required_documents: Vec<String>,
    pub application_steps: Vec<String>,
    pub apply_link: String,
    pub source_link: String,
    pub last_verified: NaiveDate,
    pub status: String,
    pub notes: String,
}

pub fn status_column(status: OpportunityStatus) -> &'static str {
    match status {
        OpportunityStatus::Active => "active",
        OpportunityStatus::Expired => "expired",
        OpportunityStatus::DraftNeedsReview => "draft",
    }
}

/// Inverse of `status_column`; also accepts the legacy `needs_review` value.
pub fn status_from_column(value: &str) -> Option<OpportunityStatus> {
    match value {
        "active" => Some(OpportunityStatus::Active),
        "expired" => Some(OpportunityStatus::Expired),
        "draft" | "needs_review" => Some(OpportunityStatus::DraftNeedsReview),
        _ => None,
    }
}

pub fn funding_type_column(funding_type: FundingType) -> &'static str {
    match funding_type {
        FundingType::Grant => "grant",
        FundingType::Loan => "loan",
        FundingType::Equity => "equity",
        FundingType::Mixed => "mixed",
        FundingType::CompetitionPrize => "competition",
    }
}

pub fn business_stage_column(stage: BusinessStage) -> &'static str {
    match stage {
        BusinessStage::Startup => "startup",
        BusinessStage::Sme => "sme",
        BusinessStage::Established => "established",
        BusinessStage::Any => "any",
    }
}

pub fn opportunity_row(record: &NormalisedOpportunity) -> OpportunityRow {
    OpportunityRow {
        funding_name: record.title.clone(),
        funder: record.funder_name.clone(),
        funding_type: funding_type_column(record.funding_type).to_string(),
        description: record.description_short.clone(),
        business_stage: business_stage_column(record.business_stage).to_string(),
        eligibility_requirements: record.eligibility_bullets.clone(),
        funding_amount: format_funding_amount(record.funding_amount_min, record.funding_amount_max),
        funding_amount_min: record.funding_amount_min,
        funding_amount_max: record.funding_amount_max,
        deadline: record.deadline_date,
        is_rolling: record.is_rolling,
        required_documents: record.required_documents_bullets.clone(),
        application_steps: record.application_steps.clone(),
        apply_link: record.official_apply_url.clone(),
        source_link: record.source_url.clone(),
        last_verified: record.last_verified_date,
        status: status_column(record.status).to_string(),
        notes: import_notes(record),
    }
}

pub fn import_notes(record: &NormalisedOpportunity) -> String {
    let mut notes = format!("Imported from {}. ", record.source_name);
    if !record.validation_issues.is_empty() {
        notes.push_str("Issues: ");
        notes.push_str(&record.validation_issues.join(", "));
    }
    notes
}

fn format_rand(amount: Decimal) -> String {
    let whole = amount.trunc().to_i128().unwrap_or_default();
    if whole >= 1_000_000 {
        let millions = whole as f64 / 1_000_000.0;
        format!("R{millions:.1} million")
    } else if whole >= 1_000 {
        format!("R{}", group_thousands(whole))
    } else {
        format!("R{whole}")
    }
}

fn group_thousands(value: i128) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Human-readable amount range, e.g. `R1.0 million - R2.0 million`, `From R50,000`, `Up to R5,000`.
/// Zero amounts are treated as absent.
pub fn format_funding_amount(min: Option<Decimal>, max: Option<Decimal>) -> String {
    let min = min.filter(|v| !v.is_zero());
    let max = max.filter(|v| !v.is_zero());
    match (min, max) {
        (Some(lo), Some(hi)) => format!("{} - {}", format_rand(lo), format_rand(hi)),
        (Some(lo), None) => format!("From {}", format_rand(lo)),
        (None, Some(hi)) => format!("Up to {}", format_rand(hi)),
        (None, None) => String::new(),
    }
}

/// Column names whose values differ between the stored and incoming row.
pub fn changed_fields(old: &OpportunityRow, new: &OpportunityRow) -> Vec<&'static str> {
    let mut changed = Vec::new();
    macro_rules! cmp {
        ($($field:ident),* $(,)?) => {
            $(
                if old.$field != new.$field {
                    changed.push(stringify!($field));
                }
            )*
        };
    }
    cmp!(
        funding_name,
        funder,
        funding_type,
        description,
        business_stage,
        eligibility_requirements,
        funding_amount,
        deadline,
        is_rolling,
        required_documents,
        application_steps,
        apply_link,
        source_link,
        last_verified,
        status,
        notes,
    );
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantscout_core::{FunderType, RecordType};
    use std::str::FromStr;

    fn dec(s: &str) -> Option<Decimal> {
        Some(Decimal::from_str(s).unwrap())
    }

    fn record() -> NormalisedOpportunity {
        NormalisedOpportunity {
            record_type: RecordType::FundingOpportunity,
            title: "Youth Development Grant Programme".into(),
            funder_name: "National Youth Development Agency".into(),
            funder_type: FunderType::Gov,
            funding_type: FundingType::CompetitionPrize,
            description_short: "Grants for youth-owned businesses.".into(),
            industry_tags: vec!["Agriculture".into()],
            province_tags: vec!["National".into()],
            business_stage: BusinessStage::Sme,
            eligibility_bullets: vec!["South African citizen".into()],
            funding_amount_min: dec("1000"),
            funding_amount_max: dec("200000"),
            deadline_date: None,
            is_rolling: true,
            required_documents_bullets: vec![],
            application_steps: vec![],
            official_apply_url: "https://erp.nyda.gov.za/apply".into(),
            source_url: "https://www.nyda.gov.za/grant".into(),
            source_name: "NYDA".into(),
            last_verified_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            status: OpportunityStatus::DraftNeedsReview,
            raw_content_hash: String::new(),
            validation_issues: vec![],
        }
    }

    #[test]
    fn amount_ranges_render_in_rand() {
        assert_eq!(format_funding_amount(dec("1000000"), dec("2000000")), "R1.0 million - R2.0 million");
        assert_eq!(format_funding_amount(dec("50000"), None), "From R50,000");
        assert_eq!(format_funding_amount(None, dec("5000")), "Up to R5,000");
        assert_eq!(format_funding_amount(dec("500"), dec("2500000")), "R500 - R2.5 million");
        assert_eq!(format_funding_amount(None, None), "");
        assert_eq!(format_funding_amount(dec("0"), None), "");
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(1_000), "1,000");
        assert_eq!(group_thousands(999_999), "999,999");
        assert_eq!(group_thousands(12), "12");
    }

    #[test]
    fn row_maps_vocabularies_to_column_values() {
        let row = opportunity_row(&record());
        assert_eq!(row.funding_type, "competition");
        assert_eq!(row.business_stage, "sme");
        assert_eq!(row.status, "draft");
        assert_eq!(row.funding_amount, "R1,000 - R200,000");
        assert_eq!(row.notes, "Imported from NYDA. ");
    }

    #[test]
    fn notes_list_validation_issues() {
        let mut r = record();
        r.validation_issues = vec!["No industries identified".into(), "Unknown funder type".into()];
        assert_eq!(
            import_notes(&r),
            "Imported from NYDA. Issues: No industries identified, Unknown funder type"
        );
    }

    #[test]
    fn changed_fields_lists_only_differences() {
        let old = opportunity_row(&record());
        let mut updated = record();
        updated.title = "Youth Grant".into();
        updated.status = OpportunityStatus::Active;
        let new = opportunity_row(&updated);
        assert_eq!(changed_fields(&old, &new), vec!["funding_name", "status"]);
        assert!(changed_fields(&old, &old).is_empty());
    }

    #[test]
    fn status_columns_read_back() {
        for status in [
            OpportunityStatus::Active,
            OpportunityStatus::Expired,
            OpportunityStatus::DraftNeedsReview,
        ] {
            assert_eq!(status_from_column(status_column(status)), Some(status));
        }
        assert_eq!(status_from_column("needs_review"), Some(OpportunityStatus::DraftNeedsReview));
        assert_eq!(status_from_column("archived"), None);
    }
}
