//! Pure in-memory cosine ranking over candidate vectors.
//!
//! No I/O happens here. Candidates whose stored dimension disagrees
//! with the query are reported, never silently dropped; a zero-magnitude
//! vector on either side scores 0 rather than poisoning the ranking
//! with NaN.

use serde::Serialize;

use crate::error::SearchError;
use crate::storage::Candidate;

/// One ranked hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch {
    /// Item the matching vector belongs to.
    pub item_id: i64,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
    /// The vector was stale at ranking time.
    pub regeneration_needed: bool,
}

/// A candidate excluded from ranking because its dimension did not
/// match the query's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchedCandidate {
    /// Item the bad vector belongs to.
    pub item_id: i64,
    /// Query dimension.
    pub expected: usize,
    /// Stored dimension.
    pub actual: usize,
}

impl From<MismatchedCandidate> for SearchError {
    fn from(m: MismatchedCandidate) -> Self {
        Self::DimensionMismatch {
            id: m.item_id,
            expected: m.expected,
            actual: m.actual,
        }
    }
}

/// Ranked matches plus every candidate that could not be scored.
#[derive(Debug, Clone, Default)]
pub struct RankingOutcome {
    /// Hits above the threshold, best first.
    pub matches: Vec<ScoredMatch>,
    /// Candidates skipped for dimension mismatch.
    pub mismatched: Vec<MismatchedCandidate>,
}

/// Cosine similarity between two equal-length vectors.
///
/// Returns 0.0 when either vector has zero magnitude. Zero-length
/// vectors are valid input and fall under the same rule.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rank `candidates` against `query` and keep the best `top_k` at or
/// above `threshold`.
///
/// Ordering is by descending score with ascending item id as the
/// tiebreak, so equal-score results are stable across runs. The
/// threshold is applied before truncation; a mismatched candidate
/// never occupies a result slot.
#[must_use]
pub fn rank_candidates(
    query: &[f32],
    candidates: &[Candidate],
    top_k: usize,
    threshold: f32,
) -> RankingOutcome {
    let mut outcome = RankingOutcome::default();

    for candidate in candidates {
        if candidate.vector.len() != query.len() {
            outcome.mismatched.push(MismatchedCandidate {
                item_id: candidate.item_id,
                expected: query.len(),
                actual: candidate.vector.len(),
            });
            continue;
        }

        let score = cosine_similarity(query, &candidate.vector);
        if score >= threshold {
            outcome.matches.push(ScoredMatch {
                item_id: candidate.item_id,
                score,
                regeneration_needed: candidate.needs_regeneration,
            });
        }
    }

    outcome.matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    outcome.matches.truncate(top_k);

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(item_id: i64, vector: Vec<f32>) -> Candidate {
        Candidate {
            item_id,
            vector,
            needs_regeneration: false,
        }
    }

    #[test]
    fn test_cosine_identity_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_magnitude_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_rank_threshold_then_top_k() {
        let candidates = vec![
            candidate(1, vec![1.0, 0.0]),
            candidate(2, vec![0.0, 1.0]),
            candidate(3, vec![-1.0, 0.0]),
        ];

        let outcome = rank_candidates(&[1.0, 0.0], &candidates, 2, 0.0);
        assert!(outcome.mismatched.is_empty());
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].item_id, 1);
        assert!((outcome.matches[0].score - 1.0).abs() < 1e-6);
        assert_eq!(outcome.matches[1].item_id, 2);
        assert!(outcome.matches[1].score.abs() < 1e-6);
    }

    #[test]
    fn test_rank_equal_scores_break_ties_by_id() {
        let candidates = vec![
            candidate(7, vec![2.0, 0.0]),
            candidate(3, vec![5.0, 0.0]),
            candidate(5, vec![1.0, 0.0]),
        ];

        let outcome = rank_candidates(&[1.0, 0.0], &candidates, 10, 0.0);
        let ids: Vec<i64> = outcome.matches.iter().map(|m| m.item_id).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_rank_reports_dimension_mismatch() {
        let candidates = vec![
            candidate(1, vec![1.0, 0.0]),
            candidate(2, vec![1.0, 0.0, 0.0]),
        ];

        let outcome = rank_candidates(&[1.0, 0.0], &candidates, 10, 0.0);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(
            outcome.mismatched,
            vec![MismatchedCandidate {
                item_id: 2,
                expected: 2,
                actual: 3
            }]
        );
    }

    #[test]
    fn test_mismatch_converts_to_search_error() {
        let err: SearchError = MismatchedCandidate {
            item_id: 9,
            expected: 4,
            actual: 2,
        }
        .into();
        assert!(matches!(
            err,
            SearchError::DimensionMismatch {
                id: 9,
                expected: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_mismatch_does_not_occupy_a_slot() {
        let candidates = vec![
            candidate(1, vec![1.0, 0.0, 0.0]),
            candidate(2, vec![0.9, 0.1]),
            candidate(3, vec![0.5, 0.5]),
        ];

        let outcome = rank_candidates(&[1.0, 0.0], &candidates, 2, 0.0);
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].item_id, 2);
        assert_eq!(outcome.matches[1].item_id, 3);
    }

    #[test]
    fn test_stale_candidates_still_rank() {
        let candidates = vec![Candidate {
            item_id: 4,
            vector: vec![1.0, 0.0],
            needs_regeneration: true,
        }];

        let outcome = rank_candidates(&[1.0, 0.0], &candidates, 5, 0.0);
        assert_eq!(outcome.matches.len(), 1);
        assert!(outcome.matches[0].regeneration_needed);
    }

    #[test]
    fn test_zero_vector_candidate_filtered_by_positive_threshold() {
        let candidates = vec![candidate(1, vec![0.0, 0.0]), candidate(2, vec![1.0, 0.0])];

        let outcome = rank_candidates(&[1.0, 0.0], &candidates, 5, 0.1);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].item_id, 2);
    }
}
