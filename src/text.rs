//! Text normalisation and the length estimator
//!
//! Token counts are taken after BPE joining and special-token removal so the
//! budget is charged in words the oracle actually has to translate.

use crate::vocab::{BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

/// BPE continuation marker (`subword@@ next`)
pub const BPE_MARKER: &str = "@@ ";

/// Join BPE subwords back into words
pub fn remove_bpe(sentence: &str) -> String {
    let mut joined = format!("{} ", sentence).replace(BPE_MARKER, "");
    joined.truncate(joined.trim_end().len());
    joined
}

/// Drop special tokens and collapse whitespace
pub fn remove_special_tok(sentence: &str) -> String {
    sentence
        .split_whitespace()
        .filter(|tok| !matches!(*tok, PAD_TOKEN | BOS_TOKEN | EOS_TOKEN | UNK_TOKEN))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip segmentation artifacts and special tokens
pub fn detokenize(sentence: &str) -> String {
    remove_special_tok(&remove_bpe(sentence))
}

/// Number of whitespace tokens after detokenization
pub fn token_length(sentence: &str) -> usize {
    detokenize(sentence).split_whitespace().count()
}

/// Token counts for a whole pool, index-aligned with the input
pub fn token_lengths<S: AsRef<str>>(sentences: &[S]) -> Vec<usize> {
    sentences.iter().map(|s| token_length(s.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_bpe() {
        assert_eq!(remove_bpe("hel@@ lo wor@@ ld"), "hello world");
        assert_eq!(remove_bpe("ab@@"), "ab");
        assert_eq!(remove_bpe("plain text"), "plain text");
    }

    #[test]
    fn test_remove_special_tok() {
        assert_eq!(remove_special_tok("<s> a b </s> <pad> <pad>"), "a b");
        assert_eq!(remove_special_tok("<unk>"), "");
    }

    #[test]
    fn test_token_length() {
        assert_eq!(token_length("a b c"), 3);
        assert_eq!(token_length("d e"), 2);
        assert_eq!(token_length("hel@@ lo wor@@ ld </s>"), 2);
        assert_eq!(token_length("   "), 0);
        assert_eq!(token_length(""), 0);
    }

    #[test]
    fn test_token_lengths_aligned() {
        let pool = vec!["a b c".to_string(), "".to_string(), "x".to_string()];
        assert_eq!(token_lengths(&pool), vec![3, 0, 1]);
    }
}
