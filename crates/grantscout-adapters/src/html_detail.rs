//! Configurable adapter for sources that publish one programme per HTML page.

use async_trait::async_trait;
use grantscout_core::{RawOpportunity, SourceConfig};
use grantscout_storage::HttpFetcher;
use scraper::Html;
use tracing::{debug, warn};

use crate::{
    absolute_url, find_link_by_text, items_under_headings, lead_paragraphs, parse_selector,
    select_first_attr, select_first_text, text_or_none, AdapterError, SourceAdapter,
};

const DESCRIPTION_CONTAINERS: &[&str] = &[".field-body", ".description", ".content", "article", "main"];

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlDetailAdapter;

impl HtmlDetailAdapter {
    fn listing_links(&self, page_url: &str, html: &str, keywords: &[String]) -> Vec<String> {
        let document = Html::parse_document(html);
        let Ok(sel) = parse_selector("a[href]") else {
            return Vec::new();
        };
        document
            .select(&sel)
            .filter_map(|a| a.value().attr("href"))
            .filter(|href| {
                let lowered = href.to_lowercase();
                keywords.iter().any(|k| lowered.contains(k.as_str()))
            })
            .filter_map(|href| absolute_url(page_url, href))
            .collect()
    }
}

/// Strips a trailing ` | Site` or ` - Site` suffix from a `<title>`.
fn clean_title(title: &str) -> String {
    let cut = title
        .find(" | ")
        .or_else(|| title.rfind(" - "))
        .unwrap_or(title.len());
    title[..cut].trim().to_string()
}

fn labelled_value(document: &Html, labels: &[&str]) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector("p, li, td, dd, span")?;
    for element in document.select(&sel) {
        let Some(text) = text_or_none(element.text().collect()) else {
            continue;
        };
        let lowered = text.to_lowercase();
        if let Some(label) = labels.iter().find(|l| lowered.starts_with(*l)) {
            let value = text.get(label.len()..).unwrap_or_default();
            let value = value.trim_start_matches([':', ' ', '-']).trim();
            if !value.is_empty() {
                return Ok(Some(value.to_string()));
            }
        }
    }
    Ok(None)
}

fn split_amount_range(text: &str) -> (Option<String>, Option<String>) {
    if text.to_lowercase().starts_with("up to") {
        let rest = text.get(5..).unwrap_or_default();
        return (None, text_or_none(rest.to_string()));
    }
    for sep in [" - ", " to ", "–"] {
        if let Some((lo, hi)) = text.split_once(sep) {
            return (text_or_none(lo.to_string()), text_or_none(hi.to_string()));
        }
    }
    (None, text_or_none(text.to_string()))
}

#[async_trait]
impl SourceAdapter for HtmlDetailAdapter {
    fn name(&self) -> &'static str {
        "html-detail"
    }

    async fn opportunity_urls(
        &self,
        source: &SourceConfig,
        http: &HttpFetcher,
    ) -> Result<Vec<String>, AdapterError> {
        let Some(pattern) = source.hints.link_pattern.as_deref() else {
            return Ok(source.scrape_urls.clone());
        };
        let keywords: Vec<String> = pattern
            .split('|')
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let mut urls: Vec<String> = Vec::new();
        for listing in &source.scrape_urls {
            match http.fetch_with_delay(listing, source.rate_limit()).await {
                Ok(page) => {
                    for url in self.listing_links(&page.final_url, &page.body, &keywords) {
                        if !urls.contains(&url) && &url != listing {
                            urls.push(url);
                        }
                    }
                }
                Err(err) => warn!(source_id = %source.source_id, url = %listing, error = %err, "listing fetch failed"),
            }
        }
        debug!(source_id = %source.source_id, count = urls.len(), "discovered detail pages");
        Ok(urls)
    }

    fn extract_opportunity(
        &self,
        source: &SourceConfig,
        url: &str,
        content: &str,
    ) -> Result<RawOpportunity, AdapterError> {
        let document = Html::parse_document(content);
        let hints = &source.hints;

        let title = match select_first_text(&document, "h1")? {
            Some(h1) => Some(h1),
            None => select_first_text(&document, "title")?.map(|t| clean_title(&t)),
        };
        let description = match select_first_attr(&document, "meta[name=description]", "content")? {
            Some(d) => Some(d),
            None => lead_paragraphs(&document, DESCRIPTION_CONTAINERS, 3, 0)?,
        };

        let deadline = match select_first_text(&document, ".deadline, .closing-date")? {
            Some(d) => Some(d),
            None => labelled_value(&document, &["closing date", "deadline", "applications close"])?,
        };
        let amount_text = match select_first_text(&document, ".funding-amount, .amount")? {
            Some(a) => Some(a),
            None => labelled_value(&document, &["funding amount", "amount", "funding"])?,
        };
        let (funding_amount_min, funding_amount_max) = amount_text
            .as_deref()
            .map(split_amount_range)
            .unwrap_or((None, None));

        let body_text = document.root_element().text().collect::<String>().to_lowercase();
        let is_rolling = deadline.is_none()
            || ["rolling basis", "open all year", "applications are ongoing"]
                .iter()
                .any(|p| body_text.contains(p));

        Ok(RawOpportunity {
            title,
            funder_name: hints.funder_name.clone().or_else(|| Some(source.source_name.clone())),
            funder_type: hints.funder_type.clone(),
            funding_type: hints.funding_type.clone(),
            description,
            industries: hints.industries.clone(),
            provinces: hints.provinces.clone(),
            business_stage: hints.business_stage.clone(),
            eligibility: items_under_headings(
                &document,
                "ul, ol",
                &["eligib", "criteria", "requirement", "who can"],
                0,
            )?,
            funding_amount_min,
            funding_amount_max,
            deadline,
            is_rolling,
            required_documents: items_under_headings(&document, "ul, ol", &["document"], 0)?,
            application_steps: items_under_headings(
                &document,
                "ol",
                &["apply", "process", "step", "how to"],
                0,
            )?,
            apply_url: find_link_by_text(
                &document,
                url,
                &["apply", "application", "register"],
                &["returnurl"],
            )?,
            source_url: url.to_string(),
            raw_content: content.to_string(),
        })
    }
}
