//! Embedding-space math shared by the provider and the clustering engine.

/// Tolerance used to decide whether a vector is already unit length.
const UNIT_TOLERANCE: f32 = 1e-6;

/// Euclidean (L2) norm of a vector
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Return a unit-length copy of `v`, or `None` for an empty or all-zero vector.
/// Vectors already within tolerance of unit length are returned unchanged.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = l2_norm(v);
    if v.is_empty() || norm == 0.0 || !norm.is_finite() {
        return None;
    }
    if (norm - 1.0).abs() <= UNIT_TOLERANCE {
        return Some(v.to_vec());
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Calculate cosine similarity between two vectors.
/// Returns `None` when dimensions differ or either vector has zero length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    Some(dot / (norm_a * norm_b))
}

/// Cosine distance, `1 - cosine similarity`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    cosine_similarity(a, b).map(|s| 1.0 - s)
}

/// Fold `value` into a running mean of `count` members:
/// `mean' = (mean * n + value) / (n + 1)`.
pub fn mean_add(mean: &mut Vec<f32>, count: u32, value: &[f32]) {
    if count == 0 || mean.len() != value.len() {
        *mean = value.to_vec();
        return;
    }
    let n = count as f32;
    for (m, v) in mean.iter_mut().zip(value) {
        *m = (*m * n + v) / (n + 1.0);
    }
}

/// Remove `value` from a running mean of `count` members:
/// `mean' = (mean * n - value) / (n - 1)`. A mean of one member becomes empty.
pub fn mean_remove(mean: &mut Vec<f32>, count: u32, value: &[f32]) {
    if count <= 1 || mean.len() != value.len() {
        mean.clear();
        return;
    }
    let n = count as f32;
    for (m, v) in mean.iter_mut().zip(value) {
        *m = (*m * n - v) / (n - 1.0);
    }
}

/// Weighted combination of two running means.
pub fn mean_merge(a: &[f32], a_count: u32, b: &[f32], b_count: u32) -> Vec<f32> {
    if a_count == 0 || a.len() != b.len() {
        return b.to_vec();
    }
    if b_count == 0 {
        return a.to_vec();
    }
    let (na, nb) = (a_count as f32, b_count as f32);
    a.iter()
        .zip(b)
        .map(|(x, y)| (x * na + y * nb) / (na + nb))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6)
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b).unwrap() - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).unwrap().abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_distance(&a, &d).unwrap() - 2.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_rejects_mismatch() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).is_none());
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[], &[]).is_none());
    }

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]).unwrap();
        assert!(approx(&v, &[0.6, 0.8]));
        assert!(normalize(&[0.0, 0.0]).is_none());

        let unit = vec![1.0, 0.0];
        assert_eq!(normalize(&unit).unwrap(), unit);
    }

    #[test]
    fn test_running_mean_add_and_remove() {
        let mut mean = Vec::new();
        mean_add(&mut mean, 0, &[1.0, 0.0]);
        mean_add(&mut mean, 1, &[0.0, 1.0]);
        assert!(approx(&mean, &[0.5, 0.5]));

        mean_remove(&mut mean, 2, &[0.0, 1.0]);
        assert!(approx(&mean, &[1.0, 0.0]));

        mean_remove(&mut mean, 1, &[1.0, 0.0]);
        assert!(mean.is_empty());
    }

    #[test]
    fn test_mean_merge_weights_by_count() {
        let merged = mean_merge(&[1.0, 0.0], 3, &[0.0, 1.0], 1);
        assert!(approx(&merged, &[0.75, 0.25]));
        assert_eq!(mean_merge(&[], 0, &[0.0, 1.0], 2), vec![0.0, 1.0]);
    }
}
