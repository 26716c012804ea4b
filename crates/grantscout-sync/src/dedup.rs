use grantscout_core::{DeduplicationResult, ExistingRecord, MatchType, NormalisedOpportunity};
use strsim::normalized_levenshtein;
use tracing::debug;

/// Apply URLs containing these are shared portals, not per-opportunity links.
const GENERIC_APPLY_MARKERS: &[&str] = &[
    "application-procedures",
    "application-forms",
    "apply-online",
    "login",
    "register",
    "portal",
];

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub fuzzy_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.92,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Lowercased alphanumeric tokens, sorted, so word order does not matter.
    pub fn normalize_key_fragment(input: &str) -> String {
        let lowered = input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>();
        let mut tokens: Vec<&str> = lowered.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    }

    pub fn similarity(a: &str, b: &str) -> f64 {
        normalized_levenshtein(&Self::normalize_key_fragment(a), &Self::normalize_key_fragment(b))
    }

    fn is_generic_apply_url(url: &str) -> bool {
        let lowered = url.to_lowercase();
        GENERIC_APPLY_MARKERS.iter().any(|m| lowered.contains(m))
    }

    /// First hit wins: source URL, then apply URL, then fuzzy title + funder.
    pub fn check_duplicate(
        &self,
        record: &NormalisedOpportunity,
        existing: &[ExistingRecord],
    ) -> DeduplicationResult {
        let source_url = record.source_url.trim();
        if !source_url.is_empty() {
            if let Some(hit) = existing.iter().find(|e| e.source_url.trim() == source_url) {
                debug!(id = %hit.id, match_type = "source_url", "duplicate found");
                return DeduplicationResult::matched(hit.id, MatchType::SourceUrl, 1.0);
            }
        }

        let apply_url = record.official_apply_url.trim();
        if !apply_url.is_empty() && !Self::is_generic_apply_url(apply_url) {
            if let Some(hit) = existing.iter().find(|e| e.apply_url.trim() == apply_url) {
                debug!(id = %hit.id, match_type = "apply_url", "duplicate found");
                return DeduplicationResult::matched(hit.id, MatchType::ApplyUrl, 1.0);
            }
        }

        if record.title.trim().is_empty() || record.funder_name.trim().is_empty() {
            return DeduplicationResult::not_duplicate();
        }
        let candidate = format!("{} {}", record.title, record.funder_name);
        let best = existing
            .iter()
            .filter(|e| !e.title.trim().is_empty())
            .map(|e| (e, Self::similarity(&candidate, &format!("{} {}", e.title, e.funder_name))))
            .fold(None::<(&ExistingRecord, f64)>, |best, (e, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((e, score)),
            });

        match best {
            Some((hit, score)) if score >= self.config.fuzzy_threshold => {
                debug!(id = %hit.id, match_type = "fuzzy_title", score, "duplicate found");
                DeduplicationResult::matched(hit.id, MatchType::FuzzyTitle, score)
            }
            _ => DeduplicationResult::not_duplicate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normaliser::Normaliser;
    use grantscout_core::RawOpportunity;
    use uuid::Uuid;

    fn candidate() -> NormalisedOpportunity {
        let raw = RawOpportunity {
            title: Some("Youth Development Grant Programme".into()),
            funder_name: Some("NYDA".into()),
            apply_url: Some("https://nyda.gov.za/apply".into()),
            source_url: "https://nyda.gov.za/grant".into(),
            ..Default::default()
        };
        Normaliser::new().normalise(&raw, "NYDA")
    }

    fn existing(apply_url: &str, source_url: &str, title: &str, funder: &str) -> ExistingRecord {
        ExistingRecord {
            id: Uuid::new_v4(),
            apply_url: apply_url.into(),
            source_url: source_url.into(),
            title: title.into(),
            funder_name: funder.into(),
        }
    }

    #[test]
    fn source_url_match_takes_priority() {
        let by_apply = existing("https://nyda.gov.za/apply", "https://other/1", "Youth Development Grant Programme", "NYDA");
        let by_source = existing("https://x/apply", "https://nyda.gov.za/grant", "Unrelated", "Someone");
        let result = Deduplicator::default().check_duplicate(&candidate(), &[by_apply, by_source.clone()]);

        assert!(result.is_duplicate);
        assert_eq!(result.match_type, Some(MatchType::SourceUrl));
        assert_eq!(result.existing_record_id, Some(by_source.id));
        assert_eq!(result.similarity_score, Some(1.0));
    }

    #[test]
    fn apply_url_matches_unless_generic() {
        let hit = existing("https://nyda.gov.za/apply", "https://other/1", "Different", "Funder");
        let result = Deduplicator::default().check_duplicate(&candidate(), &[hit.clone()]);
        assert_eq!(result.match_type, Some(MatchType::ApplyUrl));
        assert_eq!(result.existing_record_id, Some(hit.id));

        let mut generic = candidate();
        generic.official_apply_url = "https://sefa.org.za/apply-online".into();
        let other = existing("https://sefa.org.za/apply-online", "https://other/2", "Different", "Funder");
        assert!(!Deduplicator::default().check_duplicate(&generic, &[other]).is_duplicate);
    }

    #[test]
    fn fuzzy_match_ignores_word_order_and_case() {
        let hit = existing("", "https://other/3", "grant programme youth development", "nyda");
        let result = Deduplicator::default().check_duplicate(&candidate(), &[hit.clone()]);
        assert_eq!(result.match_type, Some(MatchType::FuzzyTitle));
        assert_eq!(result.existing_record_id, Some(hit.id));
        assert!(result.similarity_score.unwrap() >= 0.92);
    }

    #[test]
    fn distinct_titles_are_not_duplicates() {
        let far = existing("", "https://other/4", "Agricultural Loan Scheme", "Land Bank");
        let near = existing("", "https://other/5", "Youth Development Voucher Programme", "NYDA");
        let result = Deduplicator::default().check_duplicate(&candidate(), &[far, near]);
        assert_eq!(result, DeduplicationResult::not_duplicate());
        assert!(!Deduplicator::default().check_duplicate(&candidate(), &[]).is_duplicate);
    }

    #[test]
    fn key_fragments_are_order_insensitive() {
        assert_eq!(
            Deduplicator::normalize_key_fragment("Grant, Youth!  NYDA"),
            Deduplicator::normalize_key_fragment("nyda youth grant")
        );
        assert_eq!(Deduplicator::similarity("a b", "b a"), 1.0);
    }
}
