//! Cosine similarity

/// Cosine similarity of two equal-length vectors
///
/// Accumulates in f64. Returns 0.0 when either vector has zero norm and
/// exactly 1.0 when the vectors are identical and non-zero. The result is
/// clamped to [-1, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    let mut identical = a.len() == b.len();

    for (&x, &y) in a.iter().zip(b) {
        let (x64, y64) = (x as f64, y as f64);
        dot += x64 * y64;
        norm_a += x64 * x64;
        norm_b += y64 * y64;
        identical &= x == y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    if identical {
        return 1.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_self_similarity_is_exactly_one() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let v: Vec<f32> = (0..60).map(|_| rng.gen_range(-10.0..10.0)).collect();
            assert_eq!(cosine_similarity(&v, &v), 1.0);
        }
    }

    #[test]
    fn test_zero_norm_is_zero() {
        let zero = vec![0.0; 60];
        let v = vec![0.3; 60];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn test_bounds_and_symmetry() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            let a: Vec<f32> = (0..60).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let b: Vec<f32> = (0..60).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let ab = cosine_similarity(&a, &b);
            assert!((-1.0..=1.0).contains(&ab));
            assert_eq!(ab, cosine_similarity(&b, &a));
        }
        let a = vec![1.0, 2.0, 3.0];
        let neg: Vec<f32> = a.iter().map(|x| -x).collect();
        assert_eq!(cosine_similarity(&a, &neg), -1.0);
    }
}
