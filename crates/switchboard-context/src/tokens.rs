//! Token counting for context budgets.
//!
//! Uses tiktoken encodings. Anthropic models use a proprietary tokenizer, so
//! for them these counts are close approximations, which is what budget
//! planning needs.

use std::sync::OnceLock;
use switchboard_core::TokenEncoding;
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};
use tracing::warn;

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

const HEURISTIC_CHARS_PER_TOKEN: usize = 4;

fn cl100k() -> Option<&'static CoreBPE> {
    CL100K
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(encoding = "cl100k_base", error = %e, "Tokenizer unavailable, using heuristic counts");
                None
            }
        })
        .as_ref()
}

fn o200k() -> Option<&'static CoreBPE> {
    O200K
        .get_or_init(|| match o200k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(encoding = "o200k_base", error = %e, "Tokenizer unavailable, using heuristic counts");
                None
            }
        })
        .as_ref()
}

/// Counts tokens with a fixed encoding.
#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    encoding: TokenEncoding,
}

impl TokenCounter {
    /// Counter for `encoding`.
    pub fn new(encoding: TokenEncoding) -> Self {
        Self { encoding }
    }

    /// The configured encoding.
    pub fn encoding(&self) -> TokenEncoding {
        self.encoding
    }

    fn bpe(&self) -> Option<&'static CoreBPE> {
        match self.encoding {
            TokenEncoding::Cl100kBase => cl100k(),
            TokenEncoding::O200kBase => o200k(),
            TokenEncoding::Heuristic => None,
        }
    }

    /// Number of tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.bpe() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(HEURISTIC_CHARS_PER_TOKEN),
        }
    }

    /// Longest prefix of `text` that fits in `max_tokens`, cut at a word
    /// boundary when possible.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let word_ends: Vec<usize> = text
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(i, _)| i)
            .filter(|i| *i > 0)
            .collect();
        if let Some(cut) = self.longest_fitting(text, &word_ends, max_tokens) {
            return text[..cut].trim_end().to_string();
        }

        // A single word larger than the budget: cut at character boundaries.
        let char_ends: Vec<usize> = text
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .collect();
        self.longest_fitting(text, &char_ends, max_tokens)
            .map(|cut| text[..cut].to_string())
            .unwrap_or_default()
    }

    /// Binary search over ascending cut points for the last prefix that fits.
    fn longest_fitting(&self, text: &str, cuts: &[usize], max_tokens: usize) -> Option<usize> {
        let (mut lo, mut hi) = (0usize, cuts.len());
        let mut best = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.count(&text[..cuts[mid]]) <= max_tokens {
                best = Some(cuts[mid]);
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        best
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(TokenEncoding::Cl100kBase)
    }
}
