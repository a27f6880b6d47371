use std::collections::HashMap;

use crate::models::MatchType;

/// One id after fusing the semantic and keyword rankings.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    /// Sum of reciprocal ranks over the rankers that returned this id
    pub score: f64,
    pub semantic_rank: Option<usize>,
    pub semantic_score: Option<f32>,
    pub keyword_rank: Option<usize>,
    pub keyword_score: Option<f32>,
}

impl FusedHit {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            score: 0.0,
            semantic_rank: None,
            semantic_score: None,
            keyword_rank: None,
            keyword_score: None,
        }
    }

    /// Best (lowest) 1-based rank across rankers.
    pub fn best_rank(&self) -> usize {
        match (self.semantic_rank, self.keyword_rank) {
            (Some(s), Some(k)) => s.min(k),
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => usize::MAX,
        }
    }

    pub fn match_type(&self) -> MatchType {
        match (self.semantic_rank, self.keyword_rank) {
            (Some(_), Some(_)) => MatchType::Hybrid,
            (None, Some(_)) => MatchType::Keyword,
            _ => MatchType::Semantic,
        }
    }
}

/// Contribution of a single 1-based rank.
pub fn reciprocal_rank(k: f64, rank: usize) -> f64 {
    1.0 / (k + rank as f64)
}

/// Reciprocal Rank Fusion of a semantic and a keyword ranking.
///
/// Only positions matter; raw scores are carried along for explanation but
/// never mixed. An id missing from one ranking contributes nothing from it.
/// Output is ordered by fused score descending, then best single-ranker rank
/// ascending, then id ascending, and truncated to `limit`.
pub fn rrf_fusion(
    semantic: &[(String, f32)],
    keyword: &[(String, f32)],
    k: f64,
    limit: usize,
) -> Vec<FusedHit> {
    let mut fused: HashMap<&str, FusedHit> = HashMap::new();

    for (idx, (id, score)) in semantic.iter().enumerate() {
        let rank = idx + 1;
        let entry = fused
            .entry(id.as_str())
            .or_insert_with(|| FusedHit::new(id));
        if entry.semantic_rank.is_some() {
            continue;
        }
        entry.semantic_rank = Some(rank);
        entry.semantic_score = Some(*score);
        entry.score += reciprocal_rank(k, rank);
    }

    for (idx, (id, score)) in keyword.iter().enumerate() {
        let rank = idx + 1;
        let entry = fused
            .entry(id.as_str())
            .or_insert_with(|| FusedHit::new(id));
        if entry.keyword_rank.is_some() {
            continue;
        }
        entry.keyword_rank = Some(rank);
        entry.keyword_score = Some(*score);
        entry.score += reciprocal_rank(k, rank);
    }

    let mut results: Vec<FusedHit> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(limit);
    results
}
