//! Raw adapter output → canonical record.
//!
//! Normalisation never fails. Anything it cannot map falls back to a default
//! and leaves a note in `validation_issues`.

use std::sync::LazyLock;

use chrono::{Local, NaiveDate};
use grantscout_core::{
    BusinessStage, FunderType, FundingType, NormalisedOpportunity, OpportunityStatus,
    RawOpportunity, RecordType, DESCRIPTION_MAX_CHARS,
};
use grantscout_storage::content_hash;
use regex::Regex;
use rust_decimal::Decimal;

const PROVINCE_ALIASES: &[(&str, &str)] = &[
    ("ec", "Eastern Cape"),
    ("eastern cape", "Eastern Cape"),
    ("fs", "Free State"),
    ("free state", "Free State"),
    ("gp", "Gauteng"),
    ("gauteng", "Gauteng"),
    ("gauteng province", "Gauteng"),
    ("kzn", "KwaZulu-Natal"),
    ("kwazulu-natal", "KwaZulu-Natal"),
    ("kwazulu natal", "KwaZulu-Natal"),
    ("kwa-zulu natal", "KwaZulu-Natal"),
    ("lp", "Limpopo"),
    ("limpopo", "Limpopo"),
    ("mp", "Mpumalanga"),
    ("mpumalanga", "Mpumalanga"),
    ("nc", "Northern Cape"),
    ("northern cape", "Northern Cape"),
    ("nw", "North West"),
    ("north west", "North West"),
    ("northwest", "North West"),
    ("wc", "Western Cape"),
    ("western cape", "Western Cape"),
    ("national", "National"),
    ("nationwide", "National"),
    ("all provinces", "National"),
    ("south africa", "National"),
    ("sa", "National"),
];

const INDUSTRY_ALIASES: &[(&str, &str)] = &[
    ("ict", "ICT"),
    ("it", "ICT"),
    ("tech", "ICT"),
    ("technology", "ICT"),
    ("software", "ICT"),
    ("digital", "ICT"),
    ("information technology", "ICT"),
    ("agriculture", "Agriculture"),
    ("agri", "Agriculture"),
    ("farming", "Agriculture"),
    ("agribusiness", "Agriculture"),
    ("agro", "Agriculture"),
    ("manufacturing", "Manufacturing"),
    ("production", "Manufacturing"),
    ("retail", "Retail"),
    ("trade", "Retail"),
    ("wholesale", "Retail"),
    ("retail & trade", "Retail"),
    ("commerce", "Retail"),
    ("tourism", "Tourism"),
    ("hospitality", "Tourism"),
    ("tourism & hospitality", "Tourism"),
    ("transport", "Transport"),
    ("logistics", "Transport"),
    ("transport & logistics", "Transport"),
    ("energy", "Energy"),
    ("renewables", "Energy"),
    ("energy & renewables", "Energy"),
    ("renewable energy", "Energy"),
    ("green energy", "Energy"),
    ("healthcare", "Healthcare"),
    ("health", "Healthcare"),
    ("medical", "Healthcare"),
    ("education", "Education"),
    ("training", "Education"),
    ("skills", "Education"),
    ("creative", "Creative"),
    ("creative industries", "Creative"),
    ("arts", "Creative"),
    ("media", "Creative"),
    ("entertainment", "Creative"),
    ("finance", "Finance"),
    ("financial services", "Finance"),
    ("banking", "Finance"),
    ("fintech", "Finance"),
    ("mining", "Mining"),
    ("minerals", "Mining"),
    ("services", "Services"),
    ("professional services", "Services"),
    ("construction", "Construction"),
    ("building", "Construction"),
    ("green economy", "Green Economy"),
    ("green", "Green Economy"),
    ("sustainability", "Green Economy"),
    ("environmental", "Green Economy"),
];

const FUNDING_TYPE_ALIASES: &[(&str, FundingType)] = &[
    ("grant", FundingType::Grant),
    ("grants", FundingType::Grant),
    ("loan", FundingType::Loan),
    ("loans", FundingType::Loan),
    ("finance", FundingType::Loan),
    ("equity", FundingType::Equity),
    ("investment", FundingType::Equity),
    ("mixed", FundingType::Mixed),
    ("blended", FundingType::Mixed),
    ("competition", FundingType::CompetitionPrize),
    ("prize", FundingType::CompetitionPrize),
    ("challenge", FundingType::CompetitionPrize),
    ("award", FundingType::CompetitionPrize),
];

const BUSINESS_STAGE_ALIASES: &[(&str, BusinessStage)] = &[
    ("startup", BusinessStage::Startup),
    ("start-up", BusinessStage::Startup),
    ("early stage", BusinessStage::Startup),
    ("new business", BusinessStage::Startup),
    ("sme", BusinessStage::Sme),
    ("small business", BusinessStage::Sme),
    ("medium business", BusinessStage::Sme),
    ("smme", BusinessStage::Sme),
    ("established", BusinessStage::Established),
    ("mature", BusinessStage::Established),
    ("corporate", BusinessStage::Established),
    ("any", BusinessStage::Any),
    ("all", BusinessStage::Any),
];

const FUNDER_TYPE_ALIASES: &[(&str, FunderType)] = &[
    ("gov", FunderType::Gov),
    ("government", FunderType::Gov),
    ("dfi", FunderType::Dfi),
    ("development finance", FunderType::Dfi),
    ("private", FunderType::Private),
    ("corporate", FunderType::Private),
    ("ngo", FunderType::NgoDonor),
    ("donor", FunderType::NgoDonor),
    ("ngo-donor", FunderType::NgoDonor),
    ("international", FunderType::NgoDonor),
    ("mixed", FunderType::Mixed),
];

/// Tried in order; first successful parse wins.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B, %Y",
];

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9][0-9 ,]*(?:\.[0-9]+)?)\s*(billion|million|mil|k)?\b").unwrap()
});
static ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").unwrap());

fn lookup<T: Copy>(table: &[(&str, T)], value: &str) -> Option<T> {
    let key = value.trim().to_lowercase();
    table.iter().find(|(alias, _)| *alias == key).map(|(_, v)| *v)
}

/// Canonical province for an alias, `None` when unmapped.
pub fn normalise_province(value: &str) -> Option<&'static str> {
    lookup(PROVINCE_ALIASES, value)
}

pub fn normalise_industry(value: &str) -> Option<&'static str> {
    lookup(INDUSTRY_ALIASES, value)
}

/// Parses an amount such as `"R1.5 million"`, `"R500k"` or `"R 250 000"`.
/// Anything unparseable, or too large to represent, yields `None`.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let caps = AMOUNT.captures(text)?;
    let digits: String = caps
        .get(1)?
        .as_str()
        .chars()
        .filter(|c| !matches!(c, ' ' | ','))
        .collect();
    let value: Decimal = digits.parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_lowercase()).as_deref() {
        Some("billion") => Decimal::from(1_000_000_000u64),
        Some("million") | Some("mil") => Decimal::from(1_000_000u64),
        Some("k") => Decimal::from(1_000u64),
        _ => Decimal::ONE,
    };
    value.checked_mul(multiplier).map(|v| v.normalize())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let cleaned = ORDINAL.replace_all(text.trim(), "$1");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}

/// Truncates to `DESCRIPTION_MAX_CHARS` characters, the last three being `...`.
/// Text within the bound is returned unchanged.
pub fn truncate_description(text: &str) -> String {
    if text.chars().count() <= DESCRIPTION_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(DESCRIPTION_MAX_CHARS - 3).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normaliser {
    today: Option<NaiveDate>,
}

impl Normaliser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the verification date instead of reading the local clock.
    pub fn with_today(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    pub fn normalise(&self, raw: &RawOpportunity, source_name: &str) -> NormalisedOpportunity {
        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let mut issues = Vec::new();

        let funder_type = match raw.funder_type.as_deref().and_then(|v| lookup(FUNDER_TYPE_ALIASES, v)) {
            Some(t) => t,
            None => {
                issues.push(match raw.funder_type.as_deref() {
                    Some(v) => format!("Could not map funder type: {v}"),
                    None => "Could not determine funder type".to_string(),
                });
                FunderType::Gov
            }
        };
        let funding_type = match raw.funding_type.as_deref().and_then(|v| lookup(FUNDING_TYPE_ALIASES, v)) {
            Some(t) => t,
            None => {
                issues.push(match raw.funding_type.as_deref() {
                    Some(v) => format!("Could not map funding type: {v}"),
                    None => "Could not determine funding type".to_string(),
                });
                FundingType::Grant
            }
        };
        let business_stage = match raw.business_stage.as_deref().and_then(|v| lookup(BUSINESS_STAGE_ALIASES, v)) {
            Some(s) => s,
            None => {
                issues.push(match raw.business_stage.as_deref() {
                    Some(v) => format!("Could not map business stage: {v}"),
                    None => "Could not determine business stage".to_string(),
                });
                BusinessStage::Any
            }
        };

        let mut industry_tags: Vec<String> = Vec::new();
        for tag in raw.industries.iter().filter_map(|i| normalise_industry(i)) {
            if !industry_tags.iter().any(|t| t == tag) {
                industry_tags.push(tag.to_string());
            }
        }
        if industry_tags.is_empty() {
            issues.push("No industries could be mapped".to_string());
        }

        let mut province_tags: Vec<String> = Vec::new();
        for tag in raw.provinces.iter().filter_map(|p| normalise_province(p)) {
            if !province_tags.iter().any(|t| t == tag) {
                province_tags.push(tag.to_string());
            }
        }
        if province_tags.is_empty() {
            province_tags.push("National".to_string());
        }

        let deadline_date = match raw.deadline.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(text) => {
                let parsed = parse_date(text);
                if parsed.is_none() {
                    issues.push(format!("Could not parse deadline: {text}"));
                }
                parsed
            }
            None => None,
        };

        let mut is_rolling = raw.is_rolling;
        if deadline_date.is_some() && is_rolling {
            issues.push("Conflicting deadline and rolling flag; treated as deadline-bound".to_string());
            is_rolling = false;
        }
        let record_type = if deadline_date.is_some() || !is_rolling {
            RecordType::FundingOpportunity
        } else {
            RecordType::FundingProduct
        };

        let amount = |value: &Option<String>, label: &str, issues: &mut Vec<String>| {
            let text = value.as_deref()?.trim();
            if text.is_empty() {
                return None;
            }
            let parsed = parse_amount(text);
            if parsed.is_none() {
                issues.push(format!("Could not parse {label} amount: {text}"));
            }
            parsed
        };
        let funding_amount_min = amount(&raw.funding_amount_min, "minimum", &mut issues);
        let funding_amount_max = amount(&raw.funding_amount_max, "maximum", &mut issues);

        let trimmed = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or_default().to_string();

        NormalisedOpportunity {
            record_type,
            title: trimmed(&raw.title),
            funder_name: trimmed(&raw.funder_name),
            funder_type,
            funding_type,
            description_short: truncate_description(raw.description.as_deref().unwrap_or_default().trim()),
            industry_tags,
            province_tags,
            business_stage,
            eligibility_bullets: clean_bullets(&raw.eligibility),
            funding_amount_min,
            funding_amount_max,
            deadline_date,
            is_rolling,
            required_documents_bullets: clean_bullets(&raw.required_documents),
            application_steps: clean_bullets(&raw.application_steps),
            official_apply_url: trimmed(&raw.apply_url),
            source_url: raw.source_url.trim().to_string(),
            source_name: source_name.to_string(),
            last_verified_date: today,
            status: OpportunityStatus::DraftNeedsReview,
            raw_content_hash: content_hash(raw.raw_content.as_bytes()),
            validation_issues: issues,
        }
    }
}

fn clean_bullets(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn amounts_apply_multipliers() {
        assert_eq!(parse_amount("R1 million"), Some(Decimal::from(1_000_000)));
        assert_eq!(parse_amount("R500k"), Some(Decimal::from(500_000)));
        assert_eq!(parse_amount("R1.5 billion"), Some(Decimal::from(1_500_000_000u64)));
        assert_eq!(parse_amount("R 250 000"), Some(Decimal::from(250_000)));
        assert_eq!(parse_amount("R1,250,000.50"), Some(Decimal::from_str("1250000.5").unwrap()));
        assert_eq!(parse_amount("$5,000"), Some(Decimal::from(5_000)));
        assert_eq!(parse_amount("R500 kwacha"), Some(Decimal::from(500)));
        assert_eq!(parse_amount("R2 milestones"), Some(Decimal::from(2)));
        assert_eq!(parse_amount("up to R50K per applicant"), Some(Decimal::from(50_000)));
        assert_eq!(parse_amount("negotiable"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn common_date_layouts_agree() {
        for text in [
            "15 March 2025",
            "2025/03/15",
            "15-03-2025",
            "March 15, 2025",
            "15/03/2025",
            "2025-03-15",
            "15 Mar 2025",
            "15th March 2025",
            "15 March, 2025",
        ] {
            assert_eq!(parse_date(text), Some(day(2025, 3, 15)), "{text}");
        }
        assert_eq!(parse_date("end of March"), None);
    }

    #[test]
    fn province_aliases_are_canonical() {
        for alias in ["GP", "Gauteng", "gauteng", "Gauteng Province"] {
            assert_eq!(normalise_province(alias), Some("Gauteng"));
        }
        for alias in ["National", "nationwide", "all provinces", "south africa"] {
            assert_eq!(normalise_province(alias), Some("National"));
        }
        assert_eq!(normalise_province("Atlantis"), None);
        assert_eq!(normalise_industry("Renewable Energy"), Some("Energy"));
    }

    #[test]
    fn description_is_truncated_to_bound() {
        let long = "x".repeat(301);
        let out = truncate_description(&long);
        assert_eq!(out.chars().count(), 300);
        assert!(out.ends_with("..."));

        let exact = "y".repeat(300);
        assert_eq!(truncate_description(&exact), exact);

        let padded = "  Grant for youth  ";
        assert_eq!(truncate_description(padded), padded);

        let leading = format!("{}{}", " ".repeat(10), "x".repeat(295));
        let out = truncate_description(&leading);
        assert_eq!(out.chars().count(), 300);
        assert!(out.starts_with("          x"));
        assert!(out.ends_with("..."));
    }

    #[test]
    fn unmapped_fields_default_with_issues() {
        let raw = RawOpportunity {
            title: Some(" Seed Fund ".into()),
            funder_type: Some("alien".into()),
            business_stage: Some("cosmic".into()),
            provinces: vec!["Atlantis".into()],
            source_url: "https://example.org/seed".into(),
            raw_content: "<html>seed</html>".into(),
            ..Default::default()
        };
        let n = Normaliser::with_today(day(2025, 6, 1)).normalise(&raw, "Example");

        assert_eq!(n.title, "Seed Fund");
        assert_eq!(n.funder_type, FunderType::Gov);
        assert_eq!(n.funding_type, FundingType::Grant);
        assert_eq!(n.business_stage, BusinessStage::Any);
        assert_eq!(n.province_tags, vec!["National".to_string()]);
        assert!(n.industry_tags.is_empty());
        assert_eq!(n.last_verified_date, day(2025, 6, 1));
        assert_eq!(n.status, OpportunityStatus::DraftNeedsReview);
        assert_eq!(n.raw_content_hash, content_hash(b"<html>seed</html>"));
        assert_eq!(n.record_type, RecordType::FundingOpportunity);
        for expected in [
            "Could not map funder type: alien",
            "Could not determine funding type",
            "Could not map business stage: cosmic",
            "No industries could be mapped",
        ] {
            assert!(n.validation_issues.iter().any(|i| i == expected), "{expected}");
        }
    }

    #[test]
    fn rolling_without_deadline_is_a_product() {
        let raw = RawOpportunity {
            is_rolling: true,
            industries: vec!["ICT".into(), "tech".into(), "Agri".into()],
            provinces: vec!["KZN".into(), "wc".into()],
            ..Default::default()
        };
        let n = Normaliser::new().normalise(&raw, "Example");
        assert_eq!(n.record_type, RecordType::FundingProduct);
        assert!(n.is_rolling);
        assert_eq!(n.industry_tags, vec!["ICT", "Agriculture"]);
        assert_eq!(n.province_tags, vec!["KwaZulu-Natal", "Western Cape"]);
    }

    #[test]
    fn deadline_with_rolling_flag_is_flagged() {
        let raw = RawOpportunity {
            deadline: Some("2025-12-31".into()),
            is_rolling: true,
            ..Default::default()
        };
        let n = Normaliser::new().normalise(&raw, "Example");
        assert_eq!(n.deadline_date, Some(day(2025, 12, 31)));
        assert!(!n.is_rolling);
        assert_eq!(n.record_type, RecordType::FundingOpportunity);
        assert!(n
            .validation_issues
            .contains(&"Conflicting deadline and rolling flag; treated as deadline-bound".to_string()));
    }

    #[test]
    fn unparseable_values_become_null_with_issue() {
        let raw = RawOpportunity {
            deadline: Some("soon".into()),
            funding_amount_max: Some("varies".into()),
            funding_amount_min: Some("R50 000".into()),
            ..Default::default()
        };
        let n = Normaliser::new().normalise(&raw, "Example");
        assert_eq!(n.deadline_date, None);
        assert_eq!(n.funding_amount_max, None);
        assert_eq!(n.funding_amount_min, Some(Decimal::from(50_000)));
        assert!(n.validation_issues.contains(&"Could not parse deadline: soon".to_string()));
        assert!(n
            .validation_issues
            .contains(&"Could not parse maximum amount: varies".to_string()));
    }
}
