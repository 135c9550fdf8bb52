use async_trait::async_trait;
use std::collections::HashMap;
use switchboard_core::{SwitchboardError, SwitchboardResult};

/// Computes vector representations of text for memory search.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `text`. Empty text is an error.
    async fn embed(&self, text: &str) -> SwitchboardResult<Vec<f32>>;

    /// Dimension of the vectors this provider produces.
    fn dimension(&self) -> usize;
}

/// Words too common in business notes to say anything about a memory.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it",
    "its", "of", "on", "or", "the", "this", "to", "was", "we", "were", "will", "with",
];

/// Feature kinds and their weights. Whole words dominate; adjacent word pairs
/// reward matching phrases ("renewal date"); character trigrams let
/// inflections such as "renew" and "renewal" meet.
const WORD_WEIGHT: f32 = 1.0;
const PAIR_WEIGHT: f32 = 0.6;
const TRIGRAM_WEIGHT: f32 = 0.3;

/// Offline feature-hashing embedding.
///
/// Terms are hashed into a fixed number of signed buckets, weighted by
/// sublinear term frequency, and the result is L2-normalised so a dot product
/// is a cosine similarity. Identical input always yields the identical vector.
pub struct LocalEmbedding {
    dimension: usize,
}

impl LocalEmbedding {
    /// Embedding with `dimension` buckets (at least one).
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn features(text: &str) -> HashMap<String, f32> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
            .collect();

        let mut features: HashMap<String, f32> = HashMap::new();
        let mut add = |key: String, weight: f32| *features.entry(key).or_insert(0.0) += weight;
        for word in &words {
            add(format!("w:{word}"), WORD_WEIGHT);
            let chars: Vec<char> = format!("^{word}$").chars().collect();
            if chars.len() > 4 {
                for gram in chars.windows(3) {
                    add(format!("c:{}", gram.iter().collect::<String>()), TRIGRAM_WEIGHT);
                }
            }
        }
        for pair in words.windows(2) {
            add(format!("p:{} {}", pair[0], pair[1]), PAIR_WEIGHT);
        }
        features
    }
}

impl Default for LocalEmbedding {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    async fn embed(&self, text: &str) -> SwitchboardResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(SwitchboardError::Context("cannot embed empty text".into()));
        }

        let mut vector = vec![0.0f32; self.dimension];
        for (feature, mass) in Self::features(text) {
            let h = fnv1a64(feature.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            // The top bit picks a sign so colliding features tend to cancel.
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * mass.ln_1p();
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn fnv1a64(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
