//! Cross-encoder rerank scoring.
//!
//! The default backend is a deterministic lexical scorer: saturated term
//! frequency agreement between the query and the candidate, truncated to the
//! first 256 approximate tokens. A neural cross-encoder can slot in as
//! another variant without touching the retriever.

use std::collections::HashMap;

/// Candidates are scored over at most this many approximate tokens.
pub const RERANK_TRUNCATE_TOKENS: usize = 256;

pub enum CrossEncoder {
    Lexical(LexicalScorer),
}

impl Default for CrossEncoder {
    fn default() -> Self {
        CrossEncoder::Lexical(LexicalScorer::default())
    }
}

impl CrossEncoder {
    /// Relevance of `text` to `query`, higher is better, deterministic.
    pub fn score(&self, query: &str, text: &str) -> f32 {
        match self {
            CrossEncoder::Lexical(s) => s.score(query, text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LexicalScorer {
    /// Term-frequency saturation constant, BM25's k1.
    k1: f32,
}

impl Default for LexicalScorer {
    fn default() -> Self {
        Self { k1: 1.2 }
    }
}

impl LexicalScorer {
    fn score(&self, query: &str, text: &str) -> f32 {
        let truncated = truncate_tokens(text, RERANK_TRUNCATE_TOKENS);
        let mut tf: HashMap<String, f32> = HashMap::new();
        for token in tokens(&truncated) {
            *tf.entry(token).or_insert(0.0) += 1.0;
        }
        let query_tokens: Vec<String> = tokens(query).collect();
        if query_tokens.is_empty() {
            return 0.0;
        }
        // Longer query terms carry more signal; saturate repeats.
        let mut score = 0.0f32;
        let mut weight_total = 0.0f32;
        for qt in &query_tokens {
            let weight = (qt.chars().count() as f32).sqrt();
            weight_total += weight;
            if let Some(&freq) = tf.get(qt) {
                score += weight * (freq * (self.k1 + 1.0)) / (freq + self.k1);
            }
        }
        if weight_total > 0.0 {
            score / weight_total
        } else {
            0.0
        }
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Cut at a char boundary after roughly `max_tokens` worth of text.
fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * 4;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_terms_score_higher() {
        let enc = CrossEncoder::default();
        let q = "reciprocal rank fusion";
        let hit = enc.score(q, "notes on reciprocal rank fusion and scoring");
        let miss = enc.score(q, "completely unrelated grocery list");
        assert!(hit > miss);
        assert!(miss == 0.0);
    }

    #[test]
    fn repeated_terms_saturate() {
        let enc = CrossEncoder::default();
        let once = enc.score("cache", "cache layer design");
        let many = enc.score("cache", "cache cache cache cache cache cache");
        assert!(many > once);
        assert!(many < once * 3.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let enc = CrossEncoder::default();
        let a = enc.score("alpha beta", "alpha beta gamma");
        let b = enc.score("alpha beta", "alpha beta gamma");
        assert_eq!(a, b);
    }

    #[test]
    fn text_past_the_truncation_window_is_ignored() {
        let enc = CrossEncoder::default();
        let padding = "filler ".repeat(RERANK_TRUNCATE_TOKENS);
        let tail_match = format!("{padding} needle");
        assert_eq!(enc.score("needle", &tail_match), 0.0);
    }

    #[test]
    fn empty_query_scores_zero() {
        let enc = CrossEncoder::default();
        assert_eq!(enc.score("", "anything"), 0.0);
    }
}
