use ndarray::Array1;

pub(crate) fn normalize_vector(vec: &Array1<f32>) -> Array1<f32> {
    let norm: f32 = vec.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        vec / norm
    } else {
        Array1::zeros(vec.len())
    }
}

/// Cosine similarity of two vectors that are already L2-normalised.
pub(crate) fn cosine_similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    a.dot(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize_vector(&array![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_stays_zero() {
        let v = normalize_vector(&array![0.0, 0.0, 0.0]);
        assert_eq!(v, array![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cosine_of_orthogonal_vectors() {
        let a = normalize_vector(&array![1.0, 0.0]);
        let b = normalize_vector(&array![0.0, 2.0]);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }
}
