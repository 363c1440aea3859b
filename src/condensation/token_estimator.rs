//! Token estimation and history splitting

use super::history::HistoryEntry;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Entries at the tail of a history that condensation never discards
pub const MIN_RETAINED_ENTRIES: usize = 2;

/// Token-overflow condensation discards oldest entries until more than this
/// share of the history's estimated tokens is gone
pub const TOKEN_DISCARD_RATIO: f64 = 0.8;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }
}

/// Tiktoken-based token estimator using cl100k_base
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self, String> {
        let bpe = cl100k_base().map_err(|e| e.to_string())?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Word-based token estimator (fallback, ~1.3 tokens per word)
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Tiktoken when its encoding loads, word-based otherwise
pub fn default_estimator() -> Arc<dyn TokenEstimator> {
    match TiktokenEstimator::new() {
        Ok(estimator) => Arc::new(estimator),
        Err(e) => {
            tracing::warn!("Tiktoken unavailable ({}), using word-based estimates", e);
            Arc::new(WordBasedEstimator::default())
        }
    }
}

pub fn estimate_entry_tokens(estimator: &dyn TokenEstimator, entry: &HistoryEntry) -> usize {
    estimator.estimate(&entry.text())
}

/// Estimated token size of a whole history
pub fn estimate_tokens(estimator: &dyn TokenEstimator, history: &[HistoryEntry]) -> usize {
    history
        .iter()
        .map(|e| estimate_entry_tokens(estimator, e))
        .sum()
}

/// Split off the oldest `n` entries: `(discarded, kept)`
pub fn split_by_count(
    history: &[HistoryEntry],
    n: usize,
) -> (Vec<HistoryEntry>, Vec<HistoryEntry>) {
    let n = n.min(history.len());
    (history[..n].to_vec(), history[n..].to_vec())
}

/// Number of oldest entries to drop so that more than `TOKEN_DISCARD_RATIO`
/// of `total_tokens` is discarded. The trailing `MIN_RETAINED_ENTRIES` are
/// never counted, so the result may fall short of the ratio.
pub fn token_discard_count(
    estimator: &dyn TokenEstimator,
    history: &[HistoryEntry],
    total_tokens: usize,
) -> usize {
    if total_tokens == 0 {
        return 0;
    }

    let limit = history.len().saturating_sub(MIN_RETAINED_ENTRIES);
    let threshold = total_tokens as f64 * TOKEN_DISCARD_RATIO;
    let mut discarded_tokens = 0usize;

    for (idx, entry) in history[..limit].iter().enumerate() {
        discarded_tokens += estimate_entry_tokens(estimator, entry);
        if discarded_tokens as f64 > threshold {
            return idx + 1;
        }
    }

    limit
}

/// Drop oldest entries until no more than 20% of `total_tokens` remains,
/// always keeping the last two entries: `(discarded, kept)`
pub fn split_by_token_budget(
    estimator: &dyn TokenEstimator,
    history: &[HistoryEntry],
    total_tokens: usize,
) -> (Vec<HistoryEntry>, Vec<HistoryEntry>) {
    let n = token_discard_count(estimator, history, total_tokens);
    split_by_count(history, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(word_counts: &[usize]) -> Vec<HistoryEntry> {
        word_counts
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let text = vec!["w"; n].join(" ");
                if i % 2 == 0 {
                    HistoryEntry::user(text)
                } else {
                    HistoryEntry::assistant(text)
                }
            })
            .collect()
    }

    fn words() -> WordBasedEstimator {
        WordBasedEstimator::new(1.0)
    }

    #[test]
    fn test_tiktoken_estimator() {
        let estimator = TiktokenEstimator::new().unwrap();
        let text = "Hello, world! This is a test.";
        let tokens = estimator.estimate(text);
        assert!(tokens > 0);
        assert!(tokens < 20);
    }

    #[test]
    fn test_word_based_estimator() {
        let estimator = WordBasedEstimator::default();
        assert_eq!(estimator.estimate("Hello world test"), 4); // 3 * 1.3 = 3.9 -> 4
    }

    #[test]
    fn test_batch_estimation() {
        let estimator = WordBasedEstimator::default();
        let tokens = estimator.estimate_batch(&["Hello", "world", "test"]);
        assert_eq!(tokens, vec![2, 2, 2]);
    }

    #[test]
    fn test_estimate_history() {
        let history = entries(&[3, 4, 5]);
        assert_eq!(estimate_tokens(&words(), &history), 12);
    }

    #[test]
    fn test_split_by_count() {
        let history = entries(&[1, 2, 3, 4]);
        let (discarded, kept) = split_by_count(&history, 3);
        assert_eq!(discarded.len(), 3);
        assert_eq!(kept, history[3..].to_vec());

        let (discarded, kept) = split_by_count(&history, 10);
        assert_eq!(discarded.len(), 4);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_token_split_stops_after_eighty_percent() {
        // 90 of 100 tokens in the first entry: one entry is enough
        let history = entries(&[90, 2, 2, 2, 2, 2]);
        let (discarded, kept) = split_by_token_budget(&words(), &history, 100);
        assert_eq!(discarded.len(), 1);
        assert_eq!(kept.len(), 5);
    }

    #[test]
    fn test_token_split_requires_strictly_more_than_eighty_percent() {
        // 50, 70, 80 are not > 80; 90 is
        let history = entries(&[50, 20, 10, 10, 5, 5]);
        let (discarded, kept) = split_by_token_budget(&words(), &history, 100);
        assert_eq!(discarded.len(), 4);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_token_split_keeps_last_two_regardless() {
        // the last two hold most tokens; ratio can never be reached
        let history = entries(&[1, 1, 1, 1, 48, 48]);
        let (discarded, kept) = split_by_token_budget(&words(), &history, 100);
        assert_eq!(discarded.len(), 4);
        assert_eq!(kept, history[4..].to_vec());
    }

    #[test]
    fn test_token_split_short_or_empty() {
        let history = entries(&[10, 10]);
        let (discarded, kept) = split_by_token_budget(&words(), &history, 20);
        assert!(discarded.is_empty());
        assert_eq!(kept.len(), 2);

        let (discarded, _) = split_by_token_budget(&words(), &entries(&[0, 0, 0]), 0);
        assert!(discarded.is_empty());
    }
}
