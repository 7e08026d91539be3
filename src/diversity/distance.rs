//! Vector distances over candidate embeddings.
//!
//! Both metrics are symmetric and satisfy the triangle inequality, which the
//! max-min selection step relies on. Cosine similarity is exposed as an
//! angular distance rather than its negation, which is not a metric.

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Distance used by the diversity selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// L2 distance.
    #[default]
    Euclidean,
    /// `acos(cosine_similarity) / pi`, in `[0, 1]`.
    Angular,
}

impl DistanceMetric {
    /// Stable name used in config and logs.
    pub fn label(self) -> &'static str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Angular => "angular",
        }
    }

    /// Normalizes rows in place when the metric only depends on direction,
    /// so [`DistanceMetric::distance_prepared`] can skip the norms.
    pub fn prepare(self, mut rows: Array2<f64>) -> Array2<f64> {
        if self == DistanceMetric::Angular {
            for mut row in rows.axis_iter_mut(Axis(0)) {
                let norm = row.dot(&row).sqrt();
                if norm > 1e-12 {
                    row.mapv_inplace(|v| v / norm);
                }
            }
        }
        rows
    }

    /// Distance between two rows produced by [`DistanceMetric::prepare`].
    pub fn distance_prepared(self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match self {
            DistanceMetric::Euclidean => euclidean_distance(a, b),
            DistanceMetric::Angular => {
                let cos = a.dot(&b).clamp(-1.0, 1.0);
                cos.acos() / std::f64::consts::PI
            }
        }
    }

    /// Distance between two raw vectors.
    pub fn distance(self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match self {
            DistanceMetric::Euclidean => euclidean_distance(a, b),
            DistanceMetric::Angular => {
                let cos = cosine_similarity(a, b).clamp(-1.0, 1.0);
                cos.acos() / std::f64::consts::PI
            }
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "angular" | "cosine" => Ok(DistanceMetric::Angular),
            other => Err(format!("unknown distance metric '{}'", other)),
        }
    }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has near-zero norm.
pub fn cosine_similarity(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    assert_eq!(
        a.len(),
        b.len(),
        "Vectors must have the same length for cosine similarity"
    );

    let dot_product = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a < 1e-10 || norm_b < 1e-10 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Euclidean distance between two vectors.
pub fn euclidean_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    assert_eq!(
        a.len(),
        b.len(),
        "Vectors must have the same length for Euclidean distance"
    );

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}
