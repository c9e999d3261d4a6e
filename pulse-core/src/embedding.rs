//! Vector and token-set similarity primitives

use std::collections::BTreeSet;

/// Dense embedding produced by the inference collaborator.
pub type Embedding = Vec<f32>;

/// Cosine similarity between two embeddings.
///
/// Returns `None` when the dimensions differ or either vector is empty, so
/// callers can fall back to a text-based measure. A zero vector yields 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Lowercased alphanumeric tokens of `text`, deduplicated.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard overlap of two sets. Two empty sets are considered identical.
pub fn jaccard_similarity<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let sim = cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-9);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).is_none());
        assert!(cosine_similarity(&[], &[]).is_none());
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), Some(0.0));
    }

    #[test]
    fn test_tokenize_normalizes() {
        let tokens = tokenize("What is Rust? rust, RUST!");
        assert_eq!(tokens.len(), 3);
        assert!(tokens.contains("rust"));
        assert!(tokens.contains("what"));
    }

    #[test]
    fn test_jaccard() {
        let a = tokenize("the quick brown fox");
        let b = tokenize("the quick red fox");
        let sim = jaccard_similarity(&a, &b);
        assert!((sim - 3.0 / 5.0).abs() < 1e-9);
        assert_eq!(jaccard_similarity(&a, &a), 1.0);
    }
}
