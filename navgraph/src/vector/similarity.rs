//! Similarity scores between vectors. Every function here is oriented so that
//! a higher score means the vectors are closer.

use serde::{Deserialize, Serialize};

/// A pure comparison of two vectors of equal length.
pub trait SimilarityFunction: Send + Sync {
    fn compare(&self, a: &[f32], b: &[f32]) -> f32;
}

impl<F> SimilarityFunction for F
where
    F: Fn(&[f32], &[f32]) -> f32 + Send + Sync,
{
    fn compare(&self, a: &[f32], b: &[f32]) -> f32 {
        self(a, b)
    }
}

/// Built-in similarity functions. Scores are bounded in `(0, 1]` for
/// Euclidean and in `[0, 1]` for normalized inputs to the other two.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorSimilarityFunction {
    /// `1 / (1 + ||a - b||²)`
    Euclidean,
    /// `(1 + a·b) / 2`
    DotProduct,
    /// `(1 + cos(a, b)) / 2`
    #[default]
    Cosine,
}

impl SimilarityFunction for VectorSimilarityFunction {
    fn compare(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            VectorSimilarityFunction::Euclidean => 1.0 / (1.0 + squared_l2(a, b)),
            VectorSimilarityFunction::DotProduct => (1.0 + dot(a, b)) / 2.0,
            VectorSimilarityFunction::Cosine => (1.0 + cosine(a, b)) / 2.0,
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Cosine of the angle between `a` and `b`; 0 when either vector is zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let (mut ab, mut aa, mut bb) = (0f32, 0f32, 0f32);
    for (x, y) in a.iter().zip(b) {
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    let norm = (aa * bb).sqrt();
    if norm == 0.0 {
        0.0
    } else {
        ab / norm
    }
}
