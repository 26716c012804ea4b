use async_trait::async_trait;
use grantscout_core::{RawOpportunity, SourceConfig};
use grantscout_storage::HttpFetcher;

use crate::{AdapterError, SourceAdapter};

/// Adapter for sources whose pages are too unstable to scrape; serves a
/// maintained set of records instead of fetching.
#[derive(Debug, Clone)]
pub struct CuratedAdapter {
    records: fn() -> Vec<RawOpportunity>,
}

impl CuratedAdapter {
    pub fn new(records: fn() -> Vec<RawOpportunity>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl SourceAdapter for CuratedAdapter {
    fn name(&self) -> &'static str {
        "curated"
    }

    async fn opportunity_urls(
        &self,
        _source: &SourceConfig,
        _http: &HttpFetcher,
    ) -> Result<Vec<String>, AdapterError> {
        Ok((self.records)().into_iter().map(|r| r.source_url).collect())
    }

    fn extract_opportunity(
        &self,
        _source: &SourceConfig,
        url: &str,
        _content: &str,
    ) -> Result<RawOpportunity, AdapterError> {
        (self.records)()
            .into_iter()
            .find(|r| r.source_url == url)
            .ok_or_else(|| AdapterError::Message(format!("no curated record for {url}")))
    }

    fn curated_records(&self, _source: &SourceConfig) -> Option<Vec<RawOpportunity>> {
        Some((self.records)())
    }
}

fn tef_records() -> Vec<RawOpportunity> {
    vec![RawOpportunity {
        title: Some("Tony Elumelu Foundation Entrepreneurship Programme".into()),
        funder_name: Some("Tony Elumelu Foundation".into()),
        funder_type: Some("international".into()),
        funding_type: Some("grant".into()),
        description: Some(
            "The TEF Entrepreneurship Programme is a 10-year, $100 million commitment to identify, \
             train, mentor and fund 10,000 African entrepreneurs. Selected entrepreneurs receive \
             seed capital, mentorship, and access to the TEFConnect digital platform."
                .into(),
        ),
        provinces: vec!["National".into()],
        business_stage: Some("startup".into()),
        eligibility: vec![
            "Must be an African citizen".into(),
            "Must have a business idea or early-stage business".into(),
            "Must be 18 years or older".into(),
            "Business must be registered or willing to register in Africa".into(),
        ],
        funding_amount_max: Some("$5,000".into()),
        is_rolling: false,
        apply_url: Some("https://www.tefconnect.com/".into()),
        source_url: "static://tef/entrepreneurship-programme".into(),
        ..Default::default()
    }]
}

/// Tony Elumelu Foundation Entrepreneurship Programme.
pub fn tef_adapter() -> CuratedAdapter {
    CuratedAdapter::new(tef_records)
}

const SEFA_PRODUCTS: &[(&str, &str, &str, &str, Option<&str>, Option<&str>)] = &[
    (
        "SEFA Direct Lending",
        "direct-lending",
        "Direct loans to small businesses from R50,000 to R5 million for working capital, \
         asset finance, and business expansion.",
        "loan",
        Some("R50,000"),
        Some("R5,000,000"),
    ),
    (
        "SEFA Wholesale Lending",
        "wholesale-lending",
        "Funding through financial intermediaries including microfinance institutions, \
         retail financial institutions, and joint ventures.",
        "loan",
        None,
        None,
    ),
    (
        "Khula Credit Guarantee",
        "credit-guarantee",
        "Credit guarantees to banks and financial institutions to encourage lending to SMMEs \
         that lack collateral.",
        "mixed",
        None,
        None,
    ),
];

fn sefa_records() -> Vec<RawOpportunity> {
    SEFA_PRODUCTS
        .iter()
        .map(|(title, slug, description, funding_type, min, max)| RawOpportunity {
            title: Some(title.to_string()),
            funder_name: Some("SEFA".into()),
            funder_type: Some("government".into()),
            funding_type: Some(funding_type.to_string()),
            description: Some(description.to_string()),
            provinces: vec!["National".into()],
            business_stage: Some("sme".into()),
            eligibility: vec![
                "Must be a South African registered business".into(),
                "Must be an SMME (Small, Medium, or Micro Enterprise)".into(),
                "Must have a viable business plan".into(),
            ],
            funding_amount_min: min.map(str::to_string),
            funding_amount_max: max.map(str::to_string),
            is_rolling: true,
            apply_url: Some(format!("https://www.sefa.org.za/products/{slug}")),
            source_url: format!("static://sefa/product/{slug}"),
            ..Default::default()
        })
        .collect()
}

/// Small Enterprise Finance Agency lending products; the live site is not
/// reliably reachable over TLS.
pub fn sefa_adapter() -> CuratedAdapter {
    CuratedAdapter::new(sefa_records)
}
