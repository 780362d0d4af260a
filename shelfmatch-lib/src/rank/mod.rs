//! Multi-source result ranking
//!
//! Merges local catalog hits with provider candidate lists into one ordered,
//! deduplicated, length-bounded list. Ranking is a pure function of its
//! inputs: the same inputs always give the same order.
//!
//! Scores from different sources are compared as-is. A provider score and a
//! local cosine similarity are not calibrated against each other.

use std::collections::HashSet;

use crate::catalog::ProductRecord;
use crate::provider::ProviderItem;

/// Maximum length, in characters, of a deduplication key
pub const IDENTITY_KEY_MAX_CHARS: usize = 300;

/// Where a candidate came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Local,
    Provider(String),
}

impl Source {
    /// Short label used in serialized results (`local`, or the provider name).
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Provider(name) => name,
        }
    }
}

/// Source-specific payload carried alongside a candidate
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateExtra {
    Local { thumb_ref: String, category: String },
    Provider(ProviderItem),
}

/// A candidate from any source in the uniform shape the ranker works on
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub source: Source,
    /// Catalog id, set for local candidates only
    pub id: Option<u64>,
    pub title: String,
    pub image_ref: String,
    /// `None` when no similarity was computed for this candidate
    pub score: Option<f32>,
    pub extra: CandidateExtra,
}

impl ScoredCandidate {
    /// A local catalog hit.
    #[must_use]
    pub fn local(record: ProductRecord, score: f32) -> Self {
        Self {
            source: Source::Local,
            id: Some(record.id),
            title: record.name,
            image_ref: record.image_ref,
            score: Some(score),
            extra: CandidateExtra::Local {
                thumb_ref: record.thumb_ref,
                category: record.category,
            },
        }
    }

    /// A provider item, scored or not.
    #[must_use]
    pub fn from_provider(provider: &str, item: ProviderItem, score: Option<f32>) -> Self {
        Self {
            source: Source::Provider(provider.to_string()),
            id: None,
            title: item.title.clone(),
            image_ref: item.image_url.clone().unwrap_or_default(),
            score,
            extra: CandidateExtra::Provider(item),
        }
    }

    /// Score used for ordering: missing or non-finite scores count as 0.0.
    #[must_use]
    pub fn effective_score(&self) -> f32 {
        self.score.filter(|s| s.is_finite()).unwrap_or(0.0)
    }

    /// Deduplication key: title and image reference, bounded in length.
    #[must_use]
    pub fn identity_key(&self) -> String {
        format!("{}|{}", self.title, self.image_ref)
            .chars()
            .take(IDENTITY_KEY_MAX_CHARS)
            .collect()
    }
}

/// Ranked, deduplicated candidates, best first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedResultSet(Vec<ScoredCandidate>);

impl RankedResultSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredCandidate> {
        self.0.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<ScoredCandidate> {
        self.0
    }
}

impl IntoIterator for RankedResultSet {
    type Item = ScoredCandidate;
    type IntoIter = std::vec::IntoIter<ScoredCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Merge local hits and provider lists into at most `top_k` results.
///
/// Candidates are concatenated local first, then each provider list in the
/// order given, stably sorted by score descending, filtered to the first
/// occurrence of each [identity key](ScoredCandidate::identity_key), and
/// truncated. Equal scores therefore keep local ahead of provider results
/// and preserve each provider's own order.
#[must_use]
pub fn rank(
    local: Vec<(ProductRecord, f32)>,
    provider_lists: Vec<(String, Vec<ScoredCandidate>)>,
    top_k: usize,
) -> RankedResultSet {
    if top_k == 0 {
        return RankedResultSet::default();
    }

    let mut candidates: Vec<ScoredCandidate> = local
        .into_iter()
        .map(|(record, score)| ScoredCandidate::local(record, score))
        .collect();
    for (provider, list) in provider_lists {
        candidates.extend(list.into_iter().map(|mut candidate| {
            candidate.source = Source::Provider(provider.clone());
            candidate.id = None;
            candidate
        }));
    }

    // sort_by is stable
    candidates.sort_by(|a, b| b.effective_score().total_cmp(&a.effective_score()));

    let mut seen = HashSet::with_capacity(candidates.len());
    let ranked = candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.identity_key()))
        .take(top_k)
        .collect();
    RankedResultSet(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, name: &str) -> ProductRecord {
        ProductRecord {
            id,
            name: name.to_string(),
            image_ref: format!("data/products/{name}.jpg"),
            thumb_ref: format!("/static/{name}.jpg"),
            category: "unknown".to_string(),
        }
    }

    fn item(title: &str, image_url: &str) -> ProviderItem {
        ProviderItem {
            external_id: format!("ext-{title}"),
            title: title.to_string(),
            image_url: Some(image_url.to_string()),
            ..ProviderItem::default()
        }
    }

    fn remote(title: &str, image_url: &str, score: Option<f32>) -> ScoredCandidate {
        ScoredCandidate::from_provider("ebay", item(title, image_url), score)
    }

    fn titles(set: &RankedResultSet) -> Vec<&str> {
        set.iter().map(|c| c.title.as_str()).collect()
    }

    #[test]
    fn test_worked_example() {
        let a = record(0, "A");
        let local = vec![(a.clone(), 0.9), (record(1, "B"), 0.5)];
        let providers = vec![(
            "ebay".to_string(),
            vec![
                remote("C", "https://img/c.jpg", Some(0.95)),
                remote(&a.name, &a.image_ref, Some(0.1)),
            ],
        )];

        let ranked = rank(local, providers, 3);

        assert_eq!(titles(&ranked), vec!["C", "A", "B"]);
        let winner = ranked.iter().nth(1).unwrap();
        assert_eq!(winner.source, Source::Local);
        assert_eq!(winner.score, Some(0.9));
    }

    #[test]
    fn test_dedup_keeps_higher_score_regardless_of_input_order() {
        let provider_first = vec![(
            "ebay".to_string(),
            vec![
                remote("X", "u", Some(0.7)),
                remote("X", "u", Some(0.2)),
            ],
        )];
        let provider_second = vec![(
            "ebay".to_string(),
            vec![
                remote("X", "u", Some(0.2)),
                remote("X", "u", Some(0.7)),
            ],
        )];

        for lists in [provider_first, provider_second] {
            let ranked = rank(Vec::new(), lists, 10);
            assert_eq!(ranked.len(), 1);
            assert_eq!(ranked.iter().next().unwrap().score, Some(0.7));
        }
    }

    #[test]
    fn test_scoreless_candidates_rank_last_in_provider_order() {
        let providers = vec![(
            "ebay".to_string(),
            vec![
                remote("first", "1", None),
                remote("scored", "2", Some(0.3)),
                remote("second", "3", None),
                remote("third", "4", None),
            ],
        )];

        let ranked = rank(Vec::new(), providers, 10);
        assert_eq!(titles(&ranked), vec!["scored", "first", "second", "third"]);
    }

    #[test]
    fn test_local_wins_exact_ties() {
        let local = vec![(record(0, "L"), 0.5)];
        let providers = vec![("ebay".to_string(), vec![remote("P", "p", Some(0.5))])];

        let ranked = rank(local, providers, 10);
        assert_eq!(titles(&ranked), vec!["L", "P"]);
    }

    #[test]
    fn test_provider_list_order_breaks_ties() {
        let providers = vec![
            ("ebay".to_string(), vec![remote("E", "e", Some(0.4))]),
            ("etsy".to_string(), vec![remote("T", "t", Some(0.4))]),
        ];

        let ranked = rank(Vec::new(), providers, 10);
        assert_eq!(titles(&ranked), vec!["E", "T"]);
        assert_eq!(
            ranked.iter().nth(1).unwrap().source,
            Source::Provider("etsy".to_string())
        );
    }

    #[test]
    fn test_truncates_to_top_k() {
        let local = (0..10).map(|i| (record(i, &format!("p{i}")), 1.0 - i as f32 * 0.05)).collect();
        let ranked = rank(local, Vec::new(), 4);
        assert_eq!(titles(&ranked), vec!["p0", "p1", "p2", "p3"]);
    }

    #[test]
    fn test_empty_inputs_and_zero_k() {
        assert!(rank(Vec::new(), Vec::new(), 10).is_empty());
        assert!(rank(vec![(record(0, "A"), 0.9)], Vec::new(), 0).is_empty());
    }

    #[test]
    fn test_deterministic_across_runs() {
        let build = || {
            let local = vec![(record(0, "A"), 0.3), (record(1, "B"), 0.3)];
            let providers = vec![(
                "ebay".to_string(),
                vec![
                    remote("C", "c", Some(0.3)),
                    remote("D", "d", None),
                    remote("E", "e", Some(0.8)),
                ],
            )];
            rank(local, providers, 10)
        };

        let first = build();
        for _ in 0..10 {
            assert_eq!(build(), first);
        }
        assert_eq!(titles(&first), vec!["E", "A", "B", "C", "D"]);
    }

    #[test]
    fn test_non_finite_scores_count_as_zero() {
        let providers = vec![(
            "ebay".to_string(),
            vec![
                remote("nan", "n", Some(f32::NAN)),
                remote("low", "l", Some(0.01)),
            ],
        )];
        let ranked = rank(Vec::new(), providers, 10);
        assert_eq!(titles(&ranked), vec!["low", "nan"]);
    }

    #[test]
    fn test_identity_key_is_bounded() {
        let long = "x".repeat(1000);
        let candidate = remote(&long, "img", None);
        assert_eq!(candidate.identity_key().chars().count(), IDENTITY_KEY_MAX_CHARS);

        // keys only differing past the bound collapse together
        let a = remote(&long, "a", Some(0.2));
        let b = remote(&long, "b", Some(0.1));
        let ranked = rank(Vec::new(), vec![("ebay".to_string(), vec![a, b])], 10);
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_provider_candidates_relabelled() {
        let candidate = ScoredCandidate::from_provider("other", item("Z", "z"), Some(0.1));
        let ranked = rank(Vec::new(), vec![("ebay".to_string(), vec![candidate])], 1);
        assert_eq!(ranked.iter().next().unwrap().source.label(), "ebay");
    }
}
