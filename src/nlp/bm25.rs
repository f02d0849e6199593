//! BM25 (Okapi) lexical scoring over a small in-memory corpus.
//!
//! Used as the keyword leg of hybrid cache retrieval. Corpora here are tiny
//! (the cache entries under one fingerprint), so this is a straightforward
//! per-query build with no inverted index.

use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;

pub struct Bm25 {
    doc_tokens: Vec<Vec<String>>,
    doc_freq: HashMap<String, usize>,
    avg_len: f64,
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl Bm25 {
    pub fn new(corpus: &[String]) -> Self {
        let doc_tokens: Vec<Vec<String>> = corpus.iter().map(|d| tokenize(d)).collect();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for tokens in &doc_tokens {
            let unique: std::collections::HashSet<&String> = tokens.iter().collect();
            for t in unique {
                *doc_freq.entry(t.clone()).or_insert(0) += 1;
            }
        }
        let avg_len = if doc_tokens.is_empty() {
            0.0
        } else {
            doc_tokens.iter().map(|t| t.len()).sum::<usize>() as f64 / doc_tokens.len() as f64
        };
        Self {
            doc_tokens,
            doc_freq,
            avg_len,
        }
    }

    /// Raw BM25 scores for `query` against every document, in corpus order.
    /// Scores can be negative when a term appears in (almost) all documents;
    /// callers are expected to normalize (see `normalized_scores`).
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let query_tokens = tokenize(query);
        let n = self.doc_tokens.len() as f64;

        self.doc_tokens
            .iter()
            .map(|doc| {
                if doc.is_empty() || self.avg_len == 0.0 {
                    return 0.0;
                }
                let len_norm = K1 * (1.0 - B + B * doc.len() as f64 / self.avg_len);
                query_tokens
                    .iter()
                    .map(|qt| {
                        let tf = doc.iter().filter(|t| *t == qt).count() as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let df = *self.doc_freq.get(qt).unwrap_or(&0) as f64;
                        // Lucene-style idf: the +1 keeps common terms from
                        // going negative on tiny corpora.
                        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                        idf * tf * (K1 + 1.0) / (tf + len_norm)
                    })
                    .sum()
            })
            .collect()
    }

    /// Scores normalized to [0, 1] with the degenerate-corpus fallbacks the
    /// hybrid retriever depends on:
    /// - negative scores (term in every doc) are shifted positive first;
    /// - an all-zero vector where the query overlaps the corpus at all maps
    ///   to all-ones (identical docs = perfect keyword match);
    /// - a single candidate with any overlap scores 1.0.
    pub fn normalized_scores(&self, query: &str) -> Vec<f64> {
        let mut scores = self.scores(query);
        if scores.is_empty() {
            return scores;
        }

        let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
        if min < 0.0 {
            for s in scores.iter_mut() {
                *s -= min;
            }
        }

        let max = scores.iter().cloned().fold(0.0_f64, f64::max);
        if max == 0.0 {
            // All-zero after shift. If the query shares any token with any
            // document this is the identical-corpus degenerate case.
            let query_tokens = tokenize(query);
            let any_overlap = self
                .doc_tokens
                .iter()
                .any(|doc| doc.iter().any(|t| query_tokens.contains(t)));
            return if any_overlap {
                vec![1.0; scores.len()]
            } else {
                scores
            };
        }

        let mut normalized: Vec<f64> = scores.iter().map(|s| s / max).collect();

        if normalized.len() == 1 && max > 0.0 {
            normalized[0] = 1.0;
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(docs: &[&str]) -> Vec<String> {
        docs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn relevant_doc_scores_higher() {
        let bm25 = Bm25::new(&corpus(&[
            "syrian hamster breeders in california",
            "used car dealerships in texas",
            "hamster care and feeding guide",
        ]));
        let scores = bm25.scores("syrian hamster breeders");
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
    }

    #[test]
    fn identical_corpus_normalizes_to_ones() {
        let bm25 = Bm25::new(&corpus(&["find hamsters", "find hamsters"]));
        let normalized = bm25.normalized_scores("find hamsters");
        assert_eq!(normalized, vec![1.0, 1.0]);
    }

    #[test]
    fn single_candidate_with_overlap_is_one() {
        let bm25 = Bm25::new(&corpus(&["syrian hamster breeders under 40"]));
        let normalized = bm25.normalized_scores("hamster breeders");
        assert_eq!(normalized, vec![1.0]);
    }

    #[test]
    fn no_overlap_stays_zero() {
        let bm25 = Bm25::new(&corpus(&["completely unrelated document"]));
        let normalized = bm25.normalized_scores("syrian hamsters");
        assert_eq!(normalized, vec![0.0]);
    }

    #[test]
    fn normalized_in_unit_range() {
        let bm25 = Bm25::new(&corpus(&[
            "hamster hamster hamster",
            "hamster cage",
            "gerbil wheel",
        ]));
        for s in bm25.normalized_scores("hamster") {
            assert!((0.0..=1.0).contains(&s));
        }
    }
}
