//! Candidate selection: provider fan-out, scoring, ranking, fallback lists.
//!
//! The selector searches the enabled providers for an input record, scores
//! every candidate against the query, and produces a [`Selection`]: the best
//! candidate plus an ordered fallback list. Rankings are deterministic:
//! total score descending, ties broken by provider-hierarchy position, then
//! by `source_id`.

pub mod score;

use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{Config, SelectionStrategy};
use crate::provider::{Candidate, ProviderRegistry, SearchQuery};
use crate::work::InputRecord;

pub use score::{normalize, token_set_ratio};

/// Score components for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    /// Token-set similarity of titles, 0..100.
    pub title_score: f64,
    /// Token-set similarity of creators, 0..100 (100 when the query has none).
    pub creator_score: f64,
    /// Bonus for richer candidates (IIIF manifest, item URL).
    pub quality_bonus: f64,
    /// Weighted total used for ranking.
    pub total: f64,
}

/// A candidate together with its scores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub scores: Scores,
}

/// A candidate dropped from selection, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedCandidate {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub reason: String,
}

/// The chosen primary candidate plus ordered fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub primary: ScoredCandidate,
    pub fallbacks: Vec<ScoredCandidate>,
    #[serde(rename = "rejected_with_reason", default)]
    pub rejected: Vec<RejectedCandidate>,
}

/// Outcome of running the selector for one input record.
#[derive(Debug, Clone)]
pub struct SelectOutcome {
    /// Every scored candidate, ranked (including below-threshold ones).
    pub candidates: Vec<ScoredCandidate>,
    /// The selection, or `None` when no candidate is acceptable.
    pub selection: Option<Selection>,
}

/// Scores one candidate against the query.
#[must_use]
pub fn score_candidate(query: &SearchQuery, candidate: &Candidate, creator_weight: f64) -> Scores {
    let title_score = token_set_ratio(&query.title, &candidate.title);

    let creator_score = match &query.creator {
        None => 100.0,
        Some(creator) => candidate
            .creators
            .iter()
            .map(|c| token_set_ratio(creator, c))
            .fold(0.0, f64::max),
    };

    let mut quality_bonus = 0.0;
    if candidate.iiif_manifest_url.is_some() {
        quality_bonus += 3.0;
    }
    if candidate.item_url.is_some() {
        quality_bonus += 0.5;
    }

    let total = title_score * (1.0 - creator_weight) + creator_score * creator_weight + quality_bonus;
    Scores {
        title_score,
        creator_score,
        quality_bonus,
        total,
    }
}

/// Fan-out search, scoring, and best-candidate selection.
pub struct Selector {
    registry: Arc<ProviderRegistry>,
    config: Arc<Config>,
}

impl Selector {
    /// Creates a selector over the given registry and configuration.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    /// Runs the configured strategy for one input record.
    #[instrument(skip(self, cancel), fields(entry_id = %record.entry_id))]
    pub async fn select(
        &self,
        record: &InputRecord,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> SelectOutcome {
        let query = SearchQuery::from_record(record);
        match self.config.selection.strategy {
            SelectionStrategy::CollectAndSelect => self.collect_and_select(&query, work_id, cancel).await,
            SelectionStrategy::SequentialFirstHit => {
                self.sequential_first_hit(&query, work_id, cancel).await
            }
        }
    }

    /// Searches every enabled provider concurrently (bounded by
    /// `max_parallel_searches`), then ranks all candidates globally.
    async fn collect_and_select(
        &self,
        query: &SearchQuery,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> SelectOutcome {
        let settings = &self.config.selection;
        let providers: Vec<(String, Arc<dyn crate::provider::ProviderAdapter>)> = self
            .config
            .enabled_providers()
            .into_iter()
            .filter_map(|key| self.registry.get(&key).map(|adapter| (key, adapter)))
            .collect();

        let results: Vec<(String, Result<Vec<Candidate>, crate::net::FetchError>)> =
            stream::iter(providers.clone())
                .map(|(key, adapter)| {
                    let query = query.clone();
                    let max = settings.max_candidates_per_provider;
                    let work_id = work_id.to_string();
                    let cancel = cancel.clone();
                    async move {
                        let result = adapter.search(&query, max, &work_id, &cancel).await;
                        (key, result)
                    }
                })
                .buffer_unordered(settings.max_parallel_searches)
                .collect()
                .await;

        let mut by_provider: HashMap<String, Vec<Candidate>> = HashMap::new();
        let mut failures: HashMap<String, String> = HashMap::new();
        for (key, result) in results {
            match result {
                Ok(candidates) => {
                    by_provider.insert(key, candidates);
                }
                Err(error) => {
                    warn!(provider = %key, error = %error, "provider search failed");
                    failures.insert(key, error.to_string());
                }
            }
        }

        // Reassemble in hierarchy order so scoring input is deterministic.
        let mut all: Vec<Candidate> = Vec::new();
        let mut search_failures: Vec<RejectedCandidate> = Vec::new();
        for (key, _) in &providers {
            if let Some(mut candidates) = by_provider.remove(key) {
                candidates.truncate(settings.max_candidates_per_provider);
                all.extend(candidates);
            }
            if let Some(detail) = failures.remove(key) {
                search_failures.push(search_failure_rejection(key, &detail));
            }
        }

        self.rank_and_select(query, all, search_failures)
    }

    /// Walks the provider hierarchy and stops at the first provider with an
    /// acceptable candidate.
    async fn sequential_first_hit(
        &self,
        query: &SearchQuery,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> SelectOutcome {
        let settings = &self.config.selection;
        let mut all_scored: Vec<ScoredCandidate> = Vec::new();
        let mut search_failures: Vec<RejectedCandidate> = Vec::new();

        for key in self.config.enabled_providers() {
            let Some(adapter) = self.registry.get(&key) else {
                continue;
            };
            let candidates = match adapter
                .search(query, settings.max_candidates_per_provider, work_id, cancel)
                .await
            {
                Ok(candidates) => candidates,
                Err(error) => {
                    warn!(provider = %key, error = %error, "provider search failed");
                    search_failures.push(search_failure_rejection(&key, &error.to_string()));
                    continue;
                }
            };

            let mut scored: Vec<ScoredCandidate> = candidates
                .into_iter()
                .take(settings.max_candidates_per_provider)
                .map(|candidate| ScoredCandidate {
                    scores: score_candidate(query, &candidate, settings.creator_weight),
                    candidate,
                })
                .collect();
            self.sort_ranked(&mut scored);

            let passing = scored
                .iter()
                .any(|c| c.scores.title_score >= settings.min_title_score);
            all_scored.extend(scored.clone());

            if passing {
                debug!(provider = %key, "sequential strategy stopping at first hit");
                return self.build_selection(all_scored, scored, search_failures);
            }
        }

        SelectOutcome {
            candidates: all_scored,
            selection: None,
        }
    }

    fn rank_and_select(
        &self,
        query: &SearchQuery,
        candidates: Vec<Candidate>,
        search_failures: Vec<RejectedCandidate>,
    ) -> SelectOutcome {
        let settings = &self.config.selection;
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|candidate| ScoredCandidate {
                scores: score_candidate(query, &candidate, settings.creator_weight),
                candidate,
            })
            .collect();
        self.sort_ranked(&mut scored);
        let pool = scored.clone();
        self.build_selection(scored, pool, search_failures)
    }

    /// Splits a ranked pool into primary/fallbacks/rejected. Rejections
    /// seeded by the caller (failed provider searches) are kept first.
    fn build_selection(
        &self,
        all_candidates: Vec<ScoredCandidate>,
        pool: Vec<ScoredCandidate>,
        search_failures: Vec<RejectedCandidate>,
    ) -> SelectOutcome {
        let min = self.config.selection.min_title_score;
        let mut passing = Vec::new();
        let mut rejected = search_failures;
        for candidate in pool {
            if candidate.scores.title_score >= min {
                passing.push(candidate);
            } else {
                rejected.push(RejectedCandidate {
                    reason: format!(
                        "title score {:.1} below threshold {min:.1}",
                        candidate.scores.title_score
                    ),
                    candidate: candidate.candidate,
                });
            }
        }

        let selection = if passing.is_empty() {
            None
        } else {
            let primary = passing.remove(0);
            Some(Selection {
                primary,
                fallbacks: passing,
                rejected,
            })
        };

        SelectOutcome {
            candidates: all_candidates,
            selection,
        }
    }

    /// Deterministic ranking: total desc, hierarchy position, `source_id`.
    fn sort_ranked(&self, scored: &mut [ScoredCandidate]) {
        scored.sort_by(|a, b| {
            b.scores
                .total
                .total_cmp(&a.scores.total)
                .then_with(|| {
                    self.config
                        .hierarchy_rank(&a.candidate.provider_key)
                        .cmp(&self.config.hierarchy_rank(&b.candidate.provider_key))
                })
                .then_with(|| a.candidate.source_id.cmp(&b.candidate.source_id))
        });
    }
}

/// Rejection record for a provider whose search call failed outright; there
/// is no candidate to attach, so only the provider identity is carried.
fn search_failure_rejection(provider_key: &str, detail: &str) -> RejectedCandidate {
    RejectedCandidate {
        candidate: Candidate {
            provider_key: provider_key.to_string(),
            provider_display_name: provider_key.to_string(),
            title: String::new(),
            creators: Vec::new(),
            date: None,
            source_id: String::new(),
            item_url: None,
            iiif_manifest_url: None,
            download_hint: serde_json::Value::Null,
            raw_metadata: serde_json::Value::Null,
        },
        reason: format!("search failed: {detail}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn candidate(provider: &str, source_id: &str, title: &str) -> Candidate {
        Candidate {
            provider_key: provider.to_string(),
            provider_display_name: provider.to_string(),
            title: title.to_string(),
            creators: Vec::new(),
            date: None,
            source_id: source_id.to_string(),
            item_url: None,
            iiif_manifest_url: None,
            download_hint: serde_json::Value::Null,
            raw_metadata: serde_json::Value::Null,
        }
    }

    fn query(title: &str) -> SearchQuery {
        SearchQuery {
            title: title.to_string(),
            creator: None,
            year: None,
        }
    }

    fn selector() -> Selector {
        Selector::new(
            Arc::new(ProviderRegistry::new()),
            Arc::new(Config::default()),
        )
    }

    #[test]
    fn test_score_exact_title_no_creator() {
        let scores = score_candidate(&query("The Raven"), &candidate("ia", "s1", "The Raven"), 0.3);
        assert!((scores.title_score - 100.0).abs() < f64::EPSILON);
        assert!((scores.creator_score - 100.0).abs() < f64::EPSILON, "absent query creator");
        assert!((scores.total - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_quality_bonus_components() {
        let mut c = candidate("ia", "s1", "The Raven");
        c.iiif_manifest_url = Some("https://example/manifest".into());
        c.item_url = Some("https://example/item".into());
        let scores = score_candidate(&query("The Raven"), &c, 0.0);
        assert!((scores.quality_bonus - 3.5).abs() < f64::EPSILON);
        assert!((scores.total - 103.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_creator_score_uses_best_match() {
        let mut c = candidate("ia", "s1", "The Raven");
        c.creators = vec!["Smith, John".into(), "Poe, Edgar Allan".into()];
        let q = SearchQuery {
            title: "The Raven".into(),
            creator: Some("Edgar Allan Poe".into()),
            year: None,
        };
        let scores = score_candidate(&q, &c, 0.3);
        assert!((scores.creator_score - 100.0).abs() < f64::EPSILON, "token-set ignores order");
    }

    #[test]
    fn test_ranking_breaks_ties_by_hierarchy_then_source_id() {
        let sel = selector();
        // Default hierarchy: ia before wellcome.
        let mut scored = vec![
            ScoredCandidate {
                candidate: candidate("wellcome", "w1", "The Raven"),
                scores: score_candidate(&query("The Raven"), &candidate("wellcome", "w1", "The Raven"), 0.3),
            },
            ScoredCandidate {
                candidate: candidate("ia", "b", "The Raven"),
                scores: score_candidate(&query("The Raven"), &candidate("ia", "b", "The Raven"), 0.3),
            },
            ScoredCandidate {
                candidate: candidate("ia", "a", "The Raven"),
                scores: score_candidate(&query("The Raven"), &candidate("ia", "a", "The Raven"), 0.3),
            },
        ];
        sel.sort_ranked(&mut scored);
        let order: Vec<_> = scored
            .iter()
            .map(|c| (c.candidate.provider_key.as_str(), c.candidate.source_id.as_str()))
            .collect();
        assert_eq!(order, [("ia", "a"), ("ia", "b"), ("wellcome", "w1")]);
    }

    #[test]
    fn test_build_selection_splits_passing_and_rejected() {
        let sel = selector();
        let q = query("The Raven");
        let good = ScoredCandidate {
            candidate: candidate("ia", "good", "The Raven"),
            scores: score_candidate(&q, &candidate("ia", "good", "The Raven"), 0.3),
        };
        let bad = ScoredCandidate {
            candidate: candidate("ia", "bad", "Completely Different Title"),
            scores: score_candidate(&q, &candidate("ia", "bad", "Completely Different Title"), 0.3),
        };
        let outcome = sel.build_selection(vec![good.clone(), bad.clone()], vec![good, bad], vec![]);

        let selection = outcome.selection.unwrap();
        assert_eq!(selection.primary.candidate.source_id, "good");
        assert!(selection.fallbacks.is_empty());
        assert_eq!(selection.rejected.len(), 1);
        assert!(selection.rejected[0].reason.contains("below threshold"));
    }

    #[test]
    fn test_build_selection_keeps_search_failure_rejections() {
        let sel = selector();
        let q = query("The Raven");
        let good = ScoredCandidate {
            candidate: candidate("ia", "good", "The Raven"),
            scores: score_candidate(&q, &candidate("ia", "good", "The Raven"), 0.3),
        };
        let failure = search_failure_rejection("wellcome", "HTTP 503 from https://example");
        let outcome =
            sel.build_selection(vec![good.clone()], vec![good], vec![failure]);

        let selection = outcome.selection.unwrap();
        assert_eq!(selection.rejected.len(), 1);
        assert_eq!(selection.rejected[0].candidate.provider_key, "wellcome");
        assert!(selection.rejected[0].reason.starts_with("search failed:"));
    }

    #[test]
    fn test_no_passing_candidate_yields_no_selection() {
        let sel = selector();
        let q = query("The Raven");
        let bad = ScoredCandidate {
            candidate: candidate("ia", "bad", "ZZZZ unknown"),
            scores: score_candidate(&q, &candidate("ia", "bad", "ZZZZ unknown"), 0.3),
        };
        let outcome = sel.build_selection(vec![bad.clone()], vec![bad], vec![]);
        assert!(outcome.selection.is_none());
        assert_eq!(outcome.candidates.len(), 1, "scored candidates kept for the journal");
    }

    #[test]
    fn test_ranking_is_reproducible() {
        let sel = selector();
        let q = query("The Raven");
        let make = || {
            vec![
                ScoredCandidate {
                    candidate: candidate("wellcome", "x", "The Raven"),
                    scores: score_candidate(&q, &candidate("wellcome", "x", "The Raven"), 0.3),
                },
                ScoredCandidate {
                    candidate: candidate("ia", "y", "The Raven"),
                    scores: score_candidate(&q, &candidate("ia", "y", "The Raven"), 0.3),
                },
            ]
        };
        let mut first = make();
        let mut second = make();
        sel.sort_ranked(&mut first);
        sel.sort_ranked(&mut second);
        assert_eq!(first, second);
    }
}
