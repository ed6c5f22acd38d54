//! Okapi BM25 scoring over a local candidate set.
//!
//! IDF is computed over the batch passed in, not over the whole corpus:
//! the vector index has already narrowed the field, and local IDF keeps
//! scores comparable within one request.

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Documents more than this multiple of the batch mean length are downweighted.
const LONG_DOC_RATIO: f32 = 10.0;
const LONG_DOC_PENALTY: f32 = 0.9;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF        // hiragana, katakana
        | 0x3400..=0x4DBF      // CJK extension A
        | 0x4E00..=0x9FFF      // CJK unified ideographs
        | 0xAC00..=0xD7AF      // hangul syllables
        | 0xF900..=0xFAFF      // CJK compatibility ideographs
    )
}

/// Lower-case word tokenizer with CJK awareness.
///
/// Latin runs split on non-word characters; CJK runs are segmented into
/// overlapping bigrams, the standard fallback when no dictionary segmenter
/// is available. Terms shorter than 2 characters are discarded.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut latin = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_latin = |buf: &mut String, out: &mut Vec<String>| {
        if buf.chars().count() >= 2 {
            out.push(std::mem::take(buf));
        } else {
            buf.clear();
        }
    };
    let flush_cjk = |run: &mut Vec<char>, out: &mut Vec<String>| {
        if run.len() >= 2 {
            for pair in run.windows(2) {
                out.push(pair.iter().collect());
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_latin(&mut latin, &mut tokens);
            cjk_run.push(c);
        } else if c.is_alphanumeric() || c == '_' {
            flush_cjk(&mut cjk_run, &mut tokens);
            latin.extend(c.to_lowercase());
        } else {
            flush_latin(&mut latin, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    flush_latin(&mut latin, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);

    tokens
}

#[derive(Debug, Clone, Default)]
pub struct Bm25Scorer {
    params: Bm25Params,
}

impl Bm25Scorer {
    pub fn new(params: Bm25Params) -> Self {
        Self { params }
    }

    /// Raw BM25 scores for `docs` against `query`, one per document.
    /// A document sharing no terms with the query scores exactly 0.
    pub fn score(&self, query: &str, docs: &[&str]) -> Vec<f32> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || docs.is_empty() {
            return vec![0.0; docs.len()];
        }

        let doc_tokens: Vec<Vec<String>> = docs.iter().map(|d| tokenize(d)).collect();
        let n = docs.len() as f32;
        let avgdl = doc_tokens.iter().map(|t| t.len()).sum::<usize>() as f32 / n;

        // Document frequency per query term, over the candidate batch.
        let mut dfs = Vec::with_capacity(query_terms.len());
        for term in &query_terms {
            let df = doc_tokens
                .iter()
                .filter(|tokens| tokens.iter().any(|t| t == term))
                .count() as f32;
            dfs.push(df);
        }

        doc_tokens
            .iter()
            .map(|tokens| {
                let dl = tokens.len() as f32;
                let mut score = 0.0f32;
                for (term, &df) in query_terms.iter().zip(&dfs) {
                    let tf = tokens.iter().filter(|t| *t == term).count() as f32;
                    if tf == 0.0 {
                        continue;
                    }
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let denom = tf
                        + self.params.k1 * (1.0 - self.params.b + self.params.b * dl / avgdl.max(1e-6));
                    score += idf * tf * (self.params.k1 + 1.0) / denom;
                }
                if avgdl > 0.0 && dl > LONG_DOC_RATIO * avgdl {
                    score *= LONG_DOC_PENALTY;
                }
                score
            })
            .collect()
    }

    /// BM25 scores normalized to [0, 1] by dividing by the batch maximum.
    pub fn score_normalized(&self, query: &str, docs: &[&str]) -> Vec<f32> {
        let mut scores = self.score(query, docs);
        let max = scores.iter().cloned().fold(0.0f32, f32::max);
        if max > 0.0 {
            for s in &mut scores {
                *s /= max;
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(tokenize("Cats AND dogs!"), vec!["cats", "and", "dogs"]);
    }

    #[test]
    fn tokenize_drops_short_terms() {
        assert_eq!(tokenize("a I am ok"), vec!["am", "ok"]);
    }

    #[test]
    fn tokenize_cjk_bigrams() {
        let tokens = tokenize("今天天气");
        assert_eq!(tokens, vec!["今天", "天天", "天气"]);
    }

    #[test]
    fn tokenize_mixed_scripts() {
        let tokens = tokenize("rust学习笔记 notes");
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.contains(&"学习".to_string()));
        assert!(tokens.contains(&"notes".to_string()));
    }

    #[test]
    fn disjoint_document_scores_zero() {
        let scorer = Bm25Scorer::default();
        let scores = scorer.score("quantum physics", &["cats and dogs are pets", "gardening tips"]);
        assert_eq!(scores, vec![0.0, 0.0]);
    }

    #[test]
    fn denser_match_scores_higher() {
        let scorer = Bm25Scorer::default();
        let scores = scorer.score("cats", &["cats and dogs are pets", "cats cats"]);
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn normalized_scores_bounded() {
        let scorer = Bm25Scorer::default();
        let scores =
            scorer.score_normalized("cats", &["cats and dogs", "cats", "nothing relevant"]);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        assert_eq!(scores.iter().cloned().fold(0.0f32, f32::max), 1.0);
    }

    #[test]
    fn long_document_downweighted() {
        let scorer = Bm25Scorer::default();
        let long_doc = "cats ".repeat(600);
        let mut docs = vec!["cats dogs"; 20];
        docs.push(long_doc.as_str());
        let scores = scorer.score("cats", &docs);
        // tf saturation alone leaves the 600-token doc ~1.39x a short match;
        // the 0.9 length penalty pulls it under 1.3x.
        assert!(scores[20] < scores[0] * 1.3);
        assert!(scores[20] > scores[0]);
    }
}
