use async_trait::async_trait;
use grantscout_core::{RawOpportunity, SourceConfig};
use grantscout_storage::HttpFetcher;
use scraper::Html;

use crate::{
    find_link_by_text, items_under_headings, lead_paragraphs, select_first_text,
    AdapterError, SourceAdapter,
};

const PROGRAMME_PAGES: &[&str] = &[
    "/Products-Services/NYDA-Grant-Programme.html",
    "/Products-Services/NYDA-Voucher-Programme.html",
    "/Products-Services/Solomon-Kalushi-Mahlangu-Scholarship-Fund.html",
    "/Products-Services/Sponsorships-Thusano-Fund.html",
    "/Products-Services/Education-and-Skills.html",
    "/Products-Services/Business-Management-Training.html",
    "/Products-Services/Market-Linkages.html",
];

const AGE_REQUIREMENT: &str = "Must be a South African citizen between 18-35 years old";

/// National Youth Development Agency programme pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NydaAdapter;

#[async_trait]
impl SourceAdapter for NydaAdapter {
    fn name(&self) -> &'static str {
        "nyda"
    }

    async fn opportunity_urls(
        &self,
        source: &SourceConfig,
        _http: &HttpFetcher,
    ) -> Result<Vec<String>, AdapterError> {
        if !source.scrape_urls.is_empty() {
            return Ok(source.scrape_urls.clone());
        }
        let base = source.base_url.trim_end_matches('/');
        Ok(PROGRAMME_PAGES.iter().map(|p| format!("{base}{p}")).collect())
    }

    fn extract_opportunity(
        &self,
        source: &SourceConfig,
        url: &str,
        content: &str,
    ) -> Result<RawOpportunity, AdapterError> {
        let document = Html::parse_document(content);

        let mut title = select_first_text(&document, "title")?;
        let generic = title
            .as_deref()
            .map_or(true, |t| matches!(t.to_lowercase().as_str(), "welcome" | "nyda"));
        if generic {
            if let Some(h1) = select_first_text(&document, "h1")? {
                title = Some(h1);
            }
        }

        let mut eligibility = items_under_headings(
            &document,
            "ul, ol",
            &["eligib", "criteria", "require"],
            5,
        )?;
        if !eligibility.iter().any(|e| e.contains("18") || e.contains("35")) {
            eligibility.insert(0, AGE_REQUIREMENT.to_string());
        }

        let base = if url.is_empty() { source.base_url.as_str() } else { url };
        let apply_url = find_link_by_text(
            &document,
            base,
            &["apply", "application"],
            &["login", "register", "returnurl"],
        )?;

        Ok(RawOpportunity {
            title,
            funder_name: Some("NYDA".to_string()),
            funder_type: Some("government".to_string()),
            funding_type: Some("grant".to_string()),
            description: lead_paragraphs(&document, &["div.description", "div.Normal"], 3, 20)?,
            provinces: vec!["National".to_string()],
            business_stage: Some("startup".to_string()),
            eligibility,
            is_rolling: true,
            apply_url,
            source_url: url.to_string(),
            raw_content: content.to_string(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantscout_core::SourceCategory;
    use grantscout_storage::HttpClientConfig;

    fn source() -> SourceConfig {
        SourceConfig {
            source_id: "nyda".into(),
            source_name: "NYDA".into(),
            base_url: "https://www.nyda.gov.za/".into(),
            scrape_urls: vec![],
            category: SourceCategory::Government,
            adapter: "nyda".into(),
            is_active: true,
            rate_limit_seconds: 2.0,
            hints: Default::default(),
        }
    }

    #[tokio::test]
    async fn programme_pages_hang_off_base_url() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let urls = NydaAdapter.opportunity_urls(&source(), &http).await.unwrap();
        assert_eq!(urls.len(), PROGRAMME_PAGES.len());
        assert_eq!(
            urls[0],
            "https://www.nyda.gov.za/Products-Services/NYDA-Grant-Programme.html"
        );
    }

    #[test]
    fn generic_title_falls_back_to_heading_and_adds_age_rule() {
        let html = r#"<html><head><title>Welcome</title></head><body>
            <h1>NYDA Grant Programme</h1>
            <div class="Normal">
              <p>Short.</p>
              <p>The grant programme supports young entrepreneurs with seed funding.</p>
            </div>
            <h3>Eligibility criteria</h3>
            <ul><li>Business must be youth-owned</li><li>n/a</li></ul>
            <a href="/Account/Register">Register to apply</a>
            <a href="https://erp.nyda.gov.za/grant-application">Online application</a>
        </body></html>"#;
        let url = "https://www.nyda.gov.za/Products-Services/NYDA-Grant-Programme.html";
        let raw = NydaAdapter.extract_opportunity(&source(), url, html).unwrap();

        assert_eq!(raw.title.as_deref(), Some("NYDA Grant Programme"));
        assert_eq!(
            raw.description.as_deref(),
            Some("The grant programme supports young entrepreneurs with seed funding.")
        );
        assert_eq!(
            raw.eligibility,
            vec![AGE_REQUIREMENT.to_string(), "Business must be youth-owned".to_string()]
        );
        assert_eq!(
            raw.apply_url.as_deref(),
            Some("https://erp.nyda.gov.za/grant-application")
        );
        assert_eq!(raw.provinces, vec!["National".to_string()]);
        assert!(raw.is_rolling);
        assert_eq!(raw.deadline, None);
    }

    #[test]
    fn explicit_age_bullet_is_not_duplicated() {
        let html = r#"<title>Voucher Programme</title><h4>Requirements</h4>
            <ul><li>Aged between 18 and 35</li></ul>"#;
        let raw = NydaAdapter
            .extract_opportunity(&source(), "https://www.nyda.gov.za/v.html", html)
            .unwrap();
        assert_eq!(raw.title.as_deref(), Some("Voucher Programme"));
        assert_eq!(raw.eligibility, vec!["Aged between 18 and 35".to_string()]);
        assert_eq!(raw.apply_url, None);
    }
}
