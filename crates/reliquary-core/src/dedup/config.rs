use crate::error::{ReliquaryError, Result};

/// Largest accepted perceptual-hash threshold. Beyond this, unrelated
/// images start to collide.
pub const MAX_PHASH_THRESHOLD: u32 = 10;

/// Configuration for duplicate detection
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Maximum Hamming distance between perceptual hashes for a link.
    /// 0 = exact match only, 10 = loose. Default: 5.
    pub phash_threshold: u32,

    /// Minimum normalized title similarity for a link. Default: 0.85.
    pub title_similarity: f32,

    /// Groups larger than this are reported as suspected over-merges.
    /// Grouping itself is unaffected. Default: none.
    pub max_group_size: Option<usize>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            phash_threshold: 5,
            title_similarity: 0.85,
            max_group_size: None,
        }
    }
}

impl DedupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phash_threshold(mut self, threshold: u32) -> Self {
        self.phash_threshold = threshold;
        self
    }

    pub fn with_title_similarity(mut self, similarity: f32) -> Self {
        self.title_similarity = similarity;
        self
    }

    pub fn with_max_group_size(mut self, max: usize) -> Self {
        self.max_group_size = Some(max);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.phash_threshold > MAX_PHASH_THRESHOLD {
            return Err(ReliquaryError::Validation(format!(
                "phash_threshold must be between 0 and {}",
                MAX_PHASH_THRESHOLD
            )));
        }

        if !(0.0..=1.0).contains(&self.title_similarity) {
            return Err(ReliquaryError::Validation(
                "title_similarity must be between 0.0 and 1.0".into(),
            ));
        }

        if self.max_group_size == Some(0) {
            return Err(ReliquaryError::Validation(
                "max_group_size must be > 0".into(),
            ));
        }

        Ok(())
    }
}
