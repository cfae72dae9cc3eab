//! Little-endian float32 packing for the embedded backend's external
//! vector index (§6 "Vector blobs are length-prefixed or fixed-length
//! packed float32 in little-endian").

pub fn pack(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub fn unpack(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine distance: `1 - cosine_similarity`. Zero vectors are treated as
/// maximally distant (distance 1.0) rather than producing NaN.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let original = vec![1.0_f32, -2.5, 0.0, 3.333];
        let packed = pack(&original);
        assert_eq!(packed.len(), original.len() * 4);
        let unpacked = unpack(&packed);
        assert_eq!(unpacked, original);
    }

    #[test]
    fn identical_vectors_have_zero_distance() {
        let v = vec![1.0, 2.0, 3.0];
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_unit_distance() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_maximally_distant() {
        let zero = vec![0.0, 0.0];
        let v = vec![1.0, 1.0];
        assert_eq!(cosine_distance(&zero, &v), 1.0);
    }
}
