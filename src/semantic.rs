use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const EMBEDDING_DIM: usize = 256;

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Lowercased alphanumeric words of a question, in order.
pub fn content_words(input: &str) -> Vec<String> {
    normalize_whitespace(input)
        .split(' ')
        .map(|value| {
            value
                .chars()
                .filter(|character| character.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|value| !value.is_empty())
        .collect()
}

/// Hashed word and bigram features, l2-normalized. Deterministic for a given
/// input text.
pub fn embed_question(payload: &str, dimensions: usize) -> Vec<f32> {
    let dims = dimensions.max(8);
    let mut vector = vec![0_f32; dims];
    let words = content_words(payload);

    if words.is_empty() {
        return vector;
    }

    for (index, word) in words.iter().enumerate() {
        accumulate_feature(&mut vector, &format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            accumulate_feature(&mut vector, &format!("b:{word}_{next}"));
        }
    }

    normalize_vector(&mut vector);
    vector
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum::<f64>()
}

fn accumulate_feature(vector: &mut [f32], feature: &str) {
    let hash = stable_hash(feature);
    let index = (hash as usize) % vector.len();
    let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
    let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
    vector[index] += sign * weight;
}

fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

pub fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    if norm == 0.0 {
        return;
    }

    for value in values {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_unit_similarity() {
        let left = embed_question("why is my refund so slow", EMBEDDING_DIM);
        let right = embed_question("why is my refund so slow", EMBEDDING_DIM);
        assert!((cosine_similarity(&left, &right) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn related_text_scores_above_unrelated_text() {
        let base = embed_question("refund for a cancelled order", EMBEDDING_DIM);
        let related = embed_question("refund status of my order", EMBEDDING_DIM);
        let unrelated = embed_question("configure kubernetes ingress tls", EMBEDDING_DIM);

        assert!(cosine_similarity(&base, &related) > cosine_similarity(&base, &unrelated));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let vector = embed_question("   ", EMBEDDING_DIM);
        assert!(vector.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn content_words_strip_punctuation_and_case() {
        assert_eq!(
            content_words("Why   is, my REFUND slow?"),
            vec!["why", "is", "my", "refund", "slow"]
        );
    }
}
