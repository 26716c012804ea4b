use chrono::{Duration, NaiveDate};
use grantscout_core::{NormalisedOpportunity, OpportunityStatus, StatusStore, StoredLifecycle};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_STALE_WINDOW_DAYS: i64 = 60;

/// Pure lifecycle classifier. Rules are evaluated in order; the first that applies wins.
#[derive(Debug, Clone, Copy)]
pub struct StatusManager {
    stale_window_days: i64,
}

impl Default for StatusManager {
    fn default() -> Self {
        Self {
            stale_window_days: DEFAULT_STALE_WINDOW_DAYS,
        }
    }
}

fn deadline_passed(deadline: Option<NaiveDate>, today: NaiveDate) -> Option<NaiveDate> {
    deadline.filter(|d| *d < today)
}

impl StatusManager {
    pub fn new(stale_window_days: i64) -> Self {
        Self { stale_window_days }
    }

    fn is_stale(&self, is_rolling: bool, last_verified: NaiveDate, today: NaiveDate) -> bool {
        is_rolling && last_verified < today - Duration::days(self.stale_window_days)
    }

    pub fn determine_status(
        &self,
        record: &NormalisedOpportunity,
        today: NaiveDate,
    ) -> OpportunityStatus {
        if deadline_passed(record.deadline_date, today).is_some() {
            return OpportunityStatus::Expired;
        }
        if self.is_stale(record.is_rolling, record.last_verified_date, today)
            || !record.missing_required_fields().is_empty()
        {
            return OpportunityStatus::DraftNeedsReview;
        }
        OpportunityStatus::Active
    }

    pub fn status_reason(&self, record: &NormalisedOpportunity, today: NaiveDate) -> String {
        if let Some(deadline) = deadline_passed(record.deadline_date, today) {
            return format!("Deadline passed: {deadline}");
        }
        if self.is_stale(record.is_rolling, record.last_verified_date, today) {
            return format!(
                "Rolling opportunity not verified since {}",
                record.last_verified_date
            );
        }
        let missing = record.missing_required_fields();
        if !missing.is_empty() {
            return format!("Missing required fields: {}", missing.join(", "));
        }
        "All validation checks passed".to_string()
    }

    /// Status a stored record decays to by `today`, with the reason, or `None`
    /// if it stays put. Only two transitions apply to stored records: a live
    /// record past its deadline expires, and an active rolling record whose
    /// verification is stale goes back to review. Nothing is promoted.
    pub fn decayed_status(
        &self,
        stored: &StoredLifecycle,
        today: NaiveDate,
    ) -> Option<(OpportunityStatus, String)> {
        if stored.status == OpportunityStatus::Expired {
            return None;
        }
        if let Some(deadline) = deadline_passed(stored.deadline_date, today) {
            return Some((OpportunityStatus::Expired, format!("Deadline passed: {deadline}")));
        }
        if stored.status == OpportunityStatus::Active
            && self.is_stale(stored.is_rolling, stored.last_verified_date, today)
        {
            return Some((
                OpportunityStatus::DraftNeedsReview,
                format!(
                    "Rolling opportunity not verified since {}",
                    stored.last_verified_date
                ),
            ));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub id: Uuid,
    pub title: String,
    pub from: OpportunityStatus,
    pub to: OpportunityStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub dry_run: bool,
    pub examined: usize,
    pub changes: Vec<StatusChange>,
}

impl RefreshSummary {
    fn count(&self, status: OpportunityStatus) -> usize {
        self.changes.iter().filter(|c| c.to == status).count()
    }

    pub fn expired(&self) -> usize {
        self.count(OpportunityStatus::Expired)
    }

    pub fn needs_review(&self) -> usize {
        self.count(OpportunityStatus::DraftNeedsReview)
    }
}

/// Re-evaluates every stored record against `today` and applies the decay
/// transitions. With `dry_run` the changes are reported but not written.
pub async fn refresh_statuses(
    store: &dyn StatusStore,
    manager: &StatusManager,
    today: NaiveDate,
    dry_run: bool,
) -> anyhow::Result<RefreshSummary> {
    let stored = store.list_lifecycles().await?;
    let mut summary = RefreshSummary {
        dry_run,
        examined: stored.len(),
        ..Default::default()
    };
    for record in stored {
        let Some((to, reason)) = manager.decayed_status(&record, today) else {
            continue;
        };
        if !dry_run {
            store.update_status(record.id, to, &reason).await?;
        }
        summary.changes.push(StatusChange {
            id: record.id,
            title: record.title,
            from: record.status,
            to,
            reason,
        });
    }
    info!(
        dry_run,
        examined = summary.examined,
        expired = summary.expired(),
        needs_review = summary.needs_review(),
        "status refresh finished"
    );
    Ok(summary)
}
