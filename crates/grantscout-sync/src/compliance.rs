//! Trust and safety policy applied to every normalised record.

use std::sync::LazyLock;

use grantscout_core::{ComplianceResult, NormalisedOpportunity};
use regex::RegexSet;
use url::Url;

pub const PAYMENT_REJECTION: &str = "Payment required to apply";
pub const SOCIAL_REJECTION: &str = "Social media only contact";

const PAYMENT_KEYWORDS: &[&str] = &[
    "application fee",
    "pay to apply",
    "registration fee",
    "payment required",
    "processing fee",
    "admin fee",
    "fee payable",
    "non-refundable fee",
    "deposit required",
    "pay before",
    "payment of r",
    "fee of r",
];

const SOCIAL_DOMAINS: &[&str] = &[
    "whatsapp.com",
    "wa.me",
    "chat.whatsapp.com",
    "telegram.org",
    "t.me",
    "telegram.me",
    "facebook.com",
    "fb.com",
    "fb.me",
    "twitter.com",
    "x.com",
    "instagram.com",
    "tiktok.com",
];

static ACCESS_CONTROL: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r#"(?i)<form[^>]*login"#,
        r#"(?i)<form[^>]*signin"#,
        r#"(?i)<input[^>]*type=["']password["']"#,
        r"(?i)please\s+log\s*in",
        r"(?i)sign\s+in\s+to\s+continue",
        r"(?i)authentication\s+required",
        r"(?i)captcha",
        r"(?i)verify\s+you\s+are\s+human",
        r"(?i)paywall",
        r"(?i)subscribe\s+to\s+(read|view|access)",
        r"(?i)premium\s+content",
        r"(?i)members\s+only",
    ])
    .unwrap()
});

/// True when raw page content looks gated behind a login, CAPTCHA or paywall.
pub fn detect_access_control(content: &str) -> bool {
    ACCESS_CONTROL.is_match(content)
}

fn is_social_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_lowercase();
    SOCIAL_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

fn valid_web_url(value: &str) -> Option<Url> {
    let url = Url::parse(value.trim()).ok()?;
    let has_host = url.host_str().is_some_and(|h| !h.is_empty());
    (matches!(url.scheme(), "http" | "https") && has_host).then_some(url)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ComplianceChecker;

impl ComplianceChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, record: &NormalisedOpportunity) -> ComplianceResult {
        let mut issues: Vec<String> = record
            .missing_required_fields()
            .into_iter()
            .map(|f| format!("Missing required field: {f}"))
            .collect();
        let mut rejection_reason = None;

        if self.requires_payment(record) {
            rejection_reason = Some(PAYMENT_REJECTION.to_string());
        }

        let mut social = false;
        for (label, value) in [
            ("apply", record.official_apply_url.as_str()),
            ("source", record.source_url.as_str()),
        ] {
            if value.trim().is_empty() {
                continue;
            }
            match valid_web_url(value) {
                Some(url) => {
                    if url.host_str().is_some_and(is_social_host) {
                        social = true;
                    }
                }
                None => issues.push(format!("Invalid {label} URL format: {value}")),
            }
        }
        if social && rejection_reason.is_none() {
            rejection_reason = Some(SOCIAL_REJECTION.to_string());
        }

        ComplianceResult::from_parts(issues, rejection_reason)
    }

    fn requires_payment(&self, record: &NormalisedOpportunity) -> bool {
        std::iter::once(&record.description_short)
            .chain(&record.eligibility_bullets)
            .chain(&record.application_steps)
            .map(|text| text.to_lowercase())
            .any(|text| PAYMENT_KEYWORDS.iter().any(|k| text.contains(k)))
    }
}
