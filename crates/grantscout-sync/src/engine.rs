//! Per-source crawl loop and the per-record pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local, NaiveDate, Utc};
use grantscout_adapters::{AdapterError, AdapterRegistry, SourceAdapter};
use grantscout_core::{
    ImportAction, Importer, NormalisedOpportunity, RawOpportunity, SourceCategory, SourceConfig,
};
use grantscout_storage::{FetchError, HttpFetcher};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::compliance::{detect_access_control, ComplianceChecker};
use crate::config::SourceRegistry;
use crate::dedup::Deduplicator;
use crate::export;
use crate::normaliser::Normaliser;
use crate::status::StatusManager;
use crate::PipelineError;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceResult {
    pub source_id: String,
    pub source_name: String,
    pub records_found: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_skipped: usize,
    pub records_rejected: usize,
    pub errors: Vec<String>,
    pub success: bool,
    /// Records that passed compliance; kept only on dry runs.
    #[serde(skip)]
    pub records: Vec<NormalisedOpportunity>,
}

impl SourceResult {
    fn new(source: &SourceConfig) -> Self {
        Self {
            source_id: source.source_id.clone(),
            source_name: source.source_name.clone(),
            ..Default::default()
        }
    }

    /// A source-level failure with nothing processed, e.g. a timeout.
    pub fn failed(source: &SourceConfig, error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            ..Self::new(source)
        }
    }

    fn skip(&mut self, error: String) {
        self.records_skipped += 1;
        self.errors.push(error);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeResult {
    pub sources_processed: usize,
    pub sources_failed: usize,
    pub records_found: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_skipped: usize,
    pub records_rejected: usize,
    pub source_results: Vec<SourceResult>,
    pub duration_secs: f64,
    #[serde(skip)]
    pub records: Vec<NormalisedOpportunity>,
}

impl ScrapeResult {
    pub fn absorb(&mut self, mut source: SourceResult) {
        self.sources_processed += 1;
        if !source.success {
            self.sources_failed += 1;
        }
        self.records_found += source.records_found;
        self.records_created += source.records_created;
        self.records_updated += source.records_updated;
        self.records_skipped += source.records_skipped;
        self.records_rejected += source.records_rejected;
        self.records.append(&mut source.records);
        self.source_results.push(source);
    }

    pub fn success(&self) -> bool {
        self.sources_failed == 0
    }
}

#[derive(Debug, Clone, Default)]
struct SourceTracking {
    last_scraped: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    needs_attention: bool,
}

/// One configured source together with its runtime tracking.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub source_name: String,
    pub category: SourceCategory,
    pub adapter: String,
    pub is_active: bool,
    pub last_scraped: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub needs_attention: bool,
}

enum RecordOutcome {
    Imported(ImportAction, NormalisedOpportunity),
    Rejected(String),
}

pub struct Engine {
    http: Arc<HttpFetcher>,
    adapters: AdapterRegistry,
    importer: Arc<dyn Importer>,
    normaliser: Normaliser,
    compliance: ComplianceChecker,
    dedup: Deduplicator,
    status: StatusManager,
    registry: SourceRegistry,
    tracking: Mutex<HashMap<String, SourceTracking>>,
    failure_threshold: u32,
    today: Option<NaiveDate>,
}

impl Engine {
    pub fn new(
        registry: SourceRegistry,
        http: Arc<HttpFetcher>,
        importer: Arc<dyn Importer>,
    ) -> Result<Self, PipelineError> {
        let adapters = AdapterRegistry::for_sources(&registry.sources)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Self {
            http,
            adapters,
            importer,
            normaliser: Normaliser::new(),
            compliance: ComplianceChecker::new(),
            dedup: Deduplicator::default(),
            status: StatusManager::default(),
            registry,
            tracking: Mutex::new(HashMap::new()),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            today: None,
        })
    }

    /// Replaces the adapter resolved for `source_id`.
    pub fn with_adapter(mut self, source_id: &str, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.register(source_id, adapter);
        self
    }

    /// Pins "today" for status and verification dates.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self.normaliser = Normaliser::with_today(today);
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.registry.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn active_sources(&self) -> Vec<SourceConfig> {
        self.registry.sources.iter().filter(|s| s.is_active).cloned().collect()
    }

    /// Explicit source ids run even when the source is inactive.
    pub fn select_sources(&self, source_id: Option<&str>) -> Result<Vec<SourceConfig>, PipelineError> {
        match source_id {
            Some(id) => self
                .source(id)
                .cloned()
                .map(|s| vec![s])
                .ok_or_else(|| PipelineError::UnknownSource(id.to_string())),
            None => Ok(self.active_sources()),
        }
    }

    pub async fn sources(&self) -> Vec<SourceSummary> {
        let tracking = self.tracking.lock().await;
        self.registry
            .sources
            .iter()
            .map(|s| {
                let t = tracking.get(&s.source_id).cloned().unwrap_or_default();
                SourceSummary {
                    source_id: s.source_id.clone(),
                    source_name: s.source_name.clone(),
                    category: s.category,
                    adapter: s.adapter.clone(),
                    is_active: s.is_active,
                    last_scraped: t.last_scraped,
                    consecutive_failures: t.consecutive_failures,
                    needs_attention: t.needs_attention,
                }
            })
            .collect()
    }

    pub async fn run(&self, source_id: Option<&str>, dry_run: bool) -> Result<ScrapeResult, PipelineError> {
        let targets = self.select_sources(source_id)?;
        let started = Instant::now();
        let mut result = ScrapeResult::default();
        for source in &targets {
            result.absorb(self.run_source(source, dry_run).await);
        }
        result.duration_secs = started.elapsed().as_secs_f64();

        info!(
            dry_run,
            duration_secs = result.duration_secs,
            sources_processed = result.sources_processed,
            sources_failed = result.sources_failed,
            found = result.records_found,
            created = result.records_created,
            updated = result.records_updated,
            skipped = result.records_skipped,
            rejected = result.records_rejected,
            "scrape run finished"
        );
        Ok(result)
    }

    /// Dry run that returns the surviving records as a JSON array.
    pub async fn scrape_to_json(&self, source_id: Option<&str>) -> Result<String, PipelineError> {
        let result = self.run(source_id, true).await?;
        export::to_json(&result.records)
    }

    /// Runs one source. Never fails: source-level errors mark the result
    /// unsuccessful and bump the source's failure counter.
    pub async fn run_source(&self, source: &SourceConfig, dry_run: bool) -> SourceResult {
        let span = info_span!("source", source_id = %source.source_id);
        async move {
            let mut result = SourceResult::new(source);
            match self.scrape_source(source, dry_run, &mut result).await {
                Ok(()) => result.success = true,
                Err(err) => {
                    error!(error = %err, "source failed");
                    result.errors.push(err.to_string());
                }
            }
            self.record_outcome(&source.source_id, result.success).await;
            info!(
                found = result.records_found,
                created = result.records_created,
                updated = result.records_updated,
                skipped = result.records_skipped,
                rejected = result.records_rejected,
                "source finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Counts a failure recorded outside `run_source`, e.g. a timeout.
    pub async fn record_outcome(&self, source_id: &str, success: bool) {
        let mut tracking = self.tracking.lock().await;
        let entry = tracking.entry(source_id.to_string()).or_default();
        if success {
            entry.last_scraped = Some(Utc::now());
            entry.consecutive_failures = 0;
            entry.needs_attention = false;
        } else {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= self.failure_threshold && !entry.needs_attention {
                entry.needs_attention = true;
                warn!(
                    source_id,
                    failures = entry.consecutive_failures,
                    "source needs attention"
                );
            }
        }
    }

    async fn scrape_source(
        &self,
        source: &SourceConfig,
        dry_run: bool,
        result: &mut SourceResult,
    ) -> Result<(), AdapterError> {
        let adapter = self.adapters.get(&source.source_id).ok_or_else(|| {
            AdapterError::Message(format!("no adapter registered for {}", source.source_id))
        })?;

        if let Some(records) = adapter.curated_records(source) {
            debug!(count = records.len(), "using curated records");
            for raw in records {
                result.records_found += 1;
                self.handle_record(source, raw, dry_run, result).await;
            }
            return Ok(());
        }

        let urls = adapter.opportunity_urls(source, &self.http).await?;
        debug!(count = urls.len(), "opportunity urls");
        for url in urls {
            result.records_found += 1;
            if !self.registry.is_approved_url(&url) {
                info!(%url, "skipped url outside approved sources");
                result.skip(format!("url outside approved sources: {url}"));
                continue;
            }
            let page = match self.http.fetch_with_delay(&url, source.rate_limit()).await {
                Ok(page) => page,
                Err(err @ FetchError::RobotsDisallowed { .. }) => {
                    info!(%url, "skipped by robots.txt");
                    result.skip(err.to_string());
                    continue;
                }
                Err(err) => {
                    warn!(%url, error = %err, "fetch failed");
                    result.skip(err.to_string());
                    continue;
                }
            };
            if detect_access_control(&page.body) {
                info!(%url, "skipped access-controlled page");
                result.skip(format!("access-controlled page: {url}"));
                continue;
            }
            let raw = match adapter.extract_opportunity(source, &url, &page.body) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(%url, error = %err, "extraction failed");
                    result.skip(format!("extraction failed for {url}: {err}"));
                    continue;
                }
            };
            self.handle_record(source, raw, dry_run, result).await;
        }
        Ok(())
    }

    async fn handle_record(
        &self,
        source: &SourceConfig,
        raw: RawOpportunity,
        dry_run: bool,
        result: &mut SourceResult,
    ) {
        let url = raw.source_url.clone();
        match self.process_record(source, &raw, dry_run).await {
            Ok(RecordOutcome::Imported(action, record)) => {
                match action {
                    ImportAction::Created => result.records_created += 1,
                    ImportAction::Updated => result.records_updated += 1,
                    ImportAction::Skipped => result.records_skipped += 1,
                }
                if dry_run {
                    result.records.push(record);
                }
            }
            Ok(RecordOutcome::Rejected(reason)) => {
                info!(%url, %reason, "record rejected");
                result.records_rejected += 1;
            }
            Err(err) => {
                warn!(%url, error = %err, "record skipped");
                result.skip(format!("{url}: {err}"));
            }
        }
    }

    async fn process_record(
        &self,
        source: &SourceConfig,
        raw: &RawOpportunity,
        dry_run: bool,
    ) -> Result<RecordOutcome, String> {
        let mut record = self.normaliser.normalise(raw, &source.source_name);

        let compliance = self.compliance.check(&record);
        if let Some(reason) = compliance.rejection_reason {
            return Ok(RecordOutcome::Rejected(reason));
        }
        for issue in compliance.issues {
            if !record.validation_issues.contains(&issue) {
                record.validation_issues.push(issue);
            }
        }

        let existing = self
            .importer
            .list_existing_records()
            .await
            .map_err(|e| format!("listing existing records: {e:#}"))?;
        let duplicate = self.dedup.check_duplicate(&record, &existing);

        record.status = self.status.determine_status(&record, self.today());

        let action = if duplicate.is_duplicate {
            ImportAction::Updated
        } else {
            ImportAction::Created
        };
        if dry_run {
            return Ok(RecordOutcome::Imported(action, record));
        }

        let imported = self
            .importer
            .import_record(&record, duplicate.existing_record_id)
            .await;
        if !imported.success {
            return Err(imported.error.unwrap_or_else(|| "import failed".to_string()));
        }
        debug!(
            action = imported.action.as_str(),
            match_type = duplicate.match_type.map(|m| m.as_str()),
            status = %record.status,
            "record imported"
        );
        Ok(RecordOutcome::Imported(imported.action, record))
    }
}
