//! Pluggable query similarity strategies

use pulse_core::{cosine_similarity, jaccard_similarity, tokenize, Embedding};
use std::collections::BTreeSet;

/// Precomputed comparison features of a query text.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFeatures {
    pub tokens: BTreeSet<String>,
    pub embedding: Option<Embedding>,
}

impl QueryFeatures {
    pub fn new(text: &str, embedding: Option<Embedding>) -> Self {
        Self {
            tokens: tokenize(text),
            embedding,
        }
    }
}

/// Scores how alike two queries are, in [0, 1].
pub trait SimilarityStrategy: Send + Sync {
    /// `None` when this strategy cannot compare the pair (e.g. missing
    /// embeddings); such candidates never match.
    fn similarity(&self, query: &QueryFeatures, candidate: &QueryFeatures) -> Option<f64>;

    fn name(&self) -> &'static str;
}

/// Cosine similarity of embeddings. Opposed vectors score 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl SimilarityStrategy for CosineSimilarity {
    fn similarity(&self, query: &QueryFeatures, candidate: &QueryFeatures) -> Option<f64> {
        let a = query.embedding.as_deref()?;
        let b = candidate.embedding.as_deref()?;
        cosine_similarity(a, b).map(|s| s.max(0.0))
    }

    fn name(&self) -> &'static str {
        "cosine"
    }
}

/// Token-set Jaccard overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaccardSimilarity;

impl SimilarityStrategy for JaccardSimilarity {
    fn similarity(&self, query: &QueryFeatures, candidate: &QueryFeatures) -> Option<f64> {
        if query.tokens.is_empty() {
            return None;
        }
        Some(jaccard_similarity(&query.tokens, &candidate.tokens))
    }

    fn name(&self) -> &'static str {
        "jaccard"
    }
}

/// Cosine when both sides carry comparable embeddings, Jaccard otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridSimilarity;

impl SimilarityStrategy for HybridSimilarity {
    fn similarity(&self, query: &QueryFeatures, candidate: &QueryFeatures) -> Option<f64> {
        CosineSimilarity
            .similarity(query, candidate)
            .or_else(|| JaccardSimilarity.similarity(query, candidate))
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_requires_both_embeddings() {
        let a = QueryFeatures::new("x", Some(vec![1.0, 0.0]));
        let b = QueryFeatures::new("x", None);
        assert_eq!(CosineSimilarity.similarity(&a, &b), None);
        assert_eq!(CosineSimilarity.similarity(&a, &a), Some(1.0));
    }

    #[test]
    fn test_cosine_clamps_negative() {
        let a = QueryFeatures::new("x", Some(vec![1.0, 0.0]));
        let b = QueryFeatures::new("x", Some(vec![-1.0, 0.0]));
        assert_eq!(CosineSimilarity.similarity(&a, &b), Some(0.0));
    }

    #[test]
    fn test_jaccard_ignores_punctuation_and_case() {
        let a = QueryFeatures::new("What is Rust?", None);
        let b = QueryFeatures::new("what is rust", None);
        assert_eq!(JaccardSimilarity.similarity(&a, &b), Some(1.0));
        let empty = QueryFeatures::new("???", None);
        assert_eq!(JaccardSimilarity.similarity(&empty, &a), None);
    }

    #[test]
    fn test_hybrid_falls_back_to_jaccard() {
        let a = QueryFeatures::new("capital of france", Some(vec![1.0, 0.0]));
        let b = QueryFeatures::new("capital of france", Some(vec![0.0, 1.0, 0.0]));
        // dimension mismatch, so token overlap decides
        assert_eq!(HybridSimilarity.similarity(&a, &b), Some(1.0));
        assert_eq!(HybridSimilarity.name(), "hybrid");
    }
}
