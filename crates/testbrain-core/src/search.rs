//! Similarity ranking over an indexed vector set.
//!
//! The ranking algorithm is independent of where vectors live; the
//! [`KnowledgeBase`](crate::knowledge::KnowledgeBase) feeds it
//! `(insertion_index, vector)` pairs and resolves the winners back to chunks.
//!
//! # Ranking
//!
//! 1. Score every candidate by cosine similarity against the query vector.
//! 2. Drop candidates scoring at or below `min_score`.
//! 3. Sort by score (desc), then insertion index (asc). The sort is stable,
//!    so equal scores keep build order.
//! 4. Truncate to `top_k`.

use anyhow::{bail, Result};

use crate::embedding::cosine_similarity;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Maximum results to return. Must be at least 1.
    pub top_k: usize,
    /// Results must score strictly above this to count as evidence.
    pub min_score: f32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.0,
        }
    }
}

/// A ranked candidate: insertion index into the indexed set plus score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ranked {
    pub index: usize,
    pub score: f32,
}

/// Rank `vectors` against `query` and return the top `params.top_k`.
///
/// `top_k` larger than the candidate count returns every qualifying
/// candidate.
pub fn rank<'a, I>(query: &[f32], vectors: I, params: &SearchParams) -> Result<Vec<Ranked>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    if params.top_k == 0 {
        bail!("top_k must be >= 1");
    }

    let mut ranked: Vec<Ranked> = vectors
        .into_iter()
        .enumerate()
        .map(|(index, v)| Ranked {
            index,
            score: cosine_similarity(query, v),
        })
        .filter(|r| r.score > params.min_score)
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    ranked.truncate(params.top_k);

    Ok(ranked)
}
