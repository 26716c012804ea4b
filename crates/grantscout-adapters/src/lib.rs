//! Source adapter contract, the startup adapter registry, and concrete adapters.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use grantscout_core::{RawOpportunity, SourceConfig};
use grantscout_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

mod curated;
mod html_detail;
mod nyda;

pub use curated::{sefa_adapter, tef_adapter, CuratedAdapter};
pub use html_detail::HtmlDetailAdapter;
pub use nyda::NydaAdapter;

pub const CRATE_NAME: &str = "grantscout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Source-specific extraction. Adapters are stateless; everything they need
/// about a source arrives through `SourceConfig`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detail-page URLs to scrape, in the order they should be processed.
    async fn opportunity_urls(
        &self,
        source: &SourceConfig,
        http: &HttpFetcher,
    ) -> Result<Vec<String>, AdapterError>;

    fn extract_opportunity(
        &self,
        source: &SourceConfig,
        url: &str,
        content: &str,
    ) -> Result<RawOpportunity, AdapterError>;

    /// Static records that replace the fetch/extract step entirely.
    fn curated_records(&self, _source: &SourceConfig) -> Option<Vec<RawOpportunity>> {
        None
    }
}

/// Resolve an adapter reference from `sources.yaml`.
pub fn adapter_for_ref(adapter_ref: &str) -> Option<Arc<dyn SourceAdapter>> {
    match adapter_ref {
        "html-detail" => Some(Arc::new(HtmlDetailAdapter)),
        "nyda" => Some(Arc::new(NydaAdapter)),
        "tef" => Some(Arc::new(tef_adapter())),
        "sefa" => Some(Arc::new(sefa_adapter())),
        _ => None,
    }
}

/// Source id → adapter, built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.adapters.iter().map(|(k, v)| (k, v.name())))
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_sources(sources: &[SourceConfig]) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        for source in sources {
            let adapter = adapter_for_ref(&source.adapter).ok_or_else(|| {
                AdapterError::Message(format!(
                    "source {} references unknown adapter {:?}",
                    source.source_id, source.adapter
                ))
            })?;
            registry.register(&source.source_id, adapter);
        }
        Ok(registry)
    }

    pub fn register(&mut self, source_id: &str, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(source_id.to_string(), adapter);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).find_map(element_text))
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Resolve `href` against `base`; non-http(s) results (mailto:, javascript:) are dropped.
fn absolute_url(base: &str, href: &str) -> Option<String> {
    let joined = match Url::parse(base) {
        Ok(base) => base.join(href.trim()).ok()?,
        Err(_) => Url::parse(href.trim()).ok()?,
    };
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

/// Up to `limit` paragraph texts longer than `min_len` from the first matching container.
fn lead_paragraphs(
    document: &Html,
    containers: &[&str],
    limit: usize,
    min_len: usize,
) -> Result<Option<String>, AdapterError> {
    let p = parse_selector("p")?;
    for container in containers {
        let sel = parse_selector(container)?;
        let Some(node) = document.select(&sel).next() else {
            continue;
        };
        let parts: Vec<String> = node
            .select(&p)
            .take(limit)
            .filter_map(element_text)
            .filter(|t| t.chars().count() > min_len)
            .collect();
        if !parts.is_empty() {
            return Ok(Some(parts.join(" ")));
        }
    }
    Ok(None)
}

/// Items of `list_tags` lists whose nearest preceding heading mentions one of `keywords`.
fn items_under_headings(
    document: &Html,
    list_tags: &str,
    keywords: &[&str],
    min_len: usize,
) -> Result<Vec<String>, AdapterError> {
    let walk = parse_selector(&format!("h1, h2, h3, h4, strong, b, {list_tags}"))?;
    let li = parse_selector("li")?;
    let mut heading = String::new();
    let mut items = Vec::new();

    for element in document.select(&walk) {
        match element.value().name() {
            "h1" | "h2" | "h3" | "h4" | "strong" | "b" => {
                heading = element_text(element).unwrap_or_default().to_lowercase();
            }
            _ => {
                if keywords.iter().any(|k| heading.contains(k)) {
                    items.extend(
                        element
                            .select(&li)
                            .filter_map(element_text)
                            .filter(|t| t.chars().count() > min_len),
                    );
                }
            }
        }
    }
    Ok(items)
}

/// First link whose text mentions one of `words`, skipping hrefs containing any of `skip`.
fn find_link_by_text(
    document: &Html,
    base: &str,
    words: &[&str],
    skip: &[&str],
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector("a[href]")?;
    for link in document.select(&sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let lowered = href.to_lowercase();
        if skip.iter().any(|s| lowered.contains(s)) {
            continue;
        }
        let text = element_text(link).unwrap_or_default().to_lowercase();
        if words.iter().any(|w| text.contains(w)) {
            if let Some(url) = absolute_url(base, href) {
                return Ok(Some(url));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantscout_core::SourceCategory;

    fn source(adapter: &str) -> SourceConfig {
        SourceConfig {
            source_id: format!("{adapter}-source"),
            source_name: "Example".into(),
            base_url: "https://example.org".into(),
            scrape_urls: vec![],
            category: SourceCategory::Government,
            adapter: adapter.into(),
            is_active: true,
            rate_limit_seconds: 2.0,
            hints: Default::default(),
        }
    }

    #[test]
    fn registry_resolves_known_adapter_refs() {
        let registry =
            AdapterRegistry::for_sources(&[source("html-detail"), source("nyda"), source("tef")])
                .unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("nyda-source").unwrap().name(), "nyda");
        assert_eq!(registry.get("tef-source").unwrap().name(), "curated");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn registry_rejects_unknown_adapter_refs() {
        let err = AdapterRegistry::for_sources(&[source("DTICAdapter")]).unwrap_err();
        assert!(err.to_string().contains("unknown adapter"));
    }

    #[test]
    fn absolute_url_resolves_relative_links() {
        assert_eq!(
            absolute_url("https://example.org/funding/index.html", "grant.html").as_deref(),
            Some("https://example.org/funding/grant.html")
        );
        assert_eq!(
            absolute_url("https://example.org/a/", "/apply").as_deref(),
            Some("https://example.org/apply")
        );
        assert_eq!(absolute_url("https://example.org", "mailto:x@example.org"), None);
    }

    #[test]
    fn headed_lists_are_collected_by_keyword() {
        let document = Html::parse_document(
            r#"<h2>Eligibility criteria</h2><ul><li>Registered business</li><li>ok</li></ul>
               <h2>Contact</h2><ul><li>Phone the office</li></ul>
               <h3>How to apply</h3><ol><li>Complete the form</li></ol>"#,
        );
        let eligibility = items_under_headings(&document, "ul, ol", &["eligib"], 5).unwrap();
        assert_eq!(eligibility, vec!["Registered business".to_string()]);
        let steps = items_under_headings(&document, "ol", &["apply"], 0).unwrap();
        assert_eq!(steps, vec!["Complete the form".to_string()]);
    }
}
