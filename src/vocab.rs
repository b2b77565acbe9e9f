//! Token vocabulary with bidirectional token/id mapping
//!
//! Stored on disk as a JSON array of tokens where the array position is the id.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";

/// Bidirectional vocabulary
#[derive(Debug, Clone)]
pub struct Vocab {
    itos: Vec<String>,
    stoi: HashMap<String, u32>,
    pad_id: u32,
    unk_id: u32,
    bos_id: u32,
    eos_id: u32,
}

impl Vocab {
    /// Build from an id-ordered token list. All four special tokens must be present.
    pub fn from_tokens(itos: Vec<String>) -> Result<Self> {
        let mut stoi = HashMap::with_capacity(itos.len());
        for (id, tok) in itos.iter().enumerate() {
            stoi.entry(tok.clone()).or_insert(id as u32);
        }

        let special = |tok: &str| {
            stoi.get(tok)
                .copied()
                .ok_or_else(|| Error::Config(format!("vocabulary is missing special token {tok}")))
        };
        let pad_id = special(PAD_TOKEN)?;
        let unk_id = special(UNK_TOKEN)?;
        let bos_id = special(BOS_TOKEN)?;
        let eos_id = special(EOS_TOKEN)?;

        Ok(Self {
            itos,
            stoi,
            pad_id,
            unk_id,
            bos_id,
            eos_id,
        })
    }

    /// Load from a JSON token array
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read vocabulary {}", path.display()), e))?;
        let itos: Vec<String> = serde_json::from_str(&content)?;
        Self::from_tokens(itos)
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    /// Token to id, falling back to UNK
    pub fn id(&self, token: &str) -> u32 {
        self.stoi.get(token).copied().unwrap_or(self.unk_id)
    }

    /// Id to token, falling back to the UNK token for ids outside the vocabulary
    pub fn token(&self, id: u32) -> &str {
        self.itos
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    /// Encode a whitespace-tokenized sentence (no BOS/EOS added)
    pub fn encode(&self, sentence: &str) -> Vec<u32> {
        sentence.split_whitespace().map(|tok| self.id(tok)).collect()
    }

    /// Render ids as a space-joined token string
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|&id| self.token(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn unk_id(&self) -> u32 {
        self.unk_id
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Vocab {
        let tokens = ["<pad>", "<unk>", "<s>", "</s>", "hello", "world"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Vocab::from_tokens(tokens).unwrap()
    }

    #[test]
    fn test_special_ids() {
        let vocab = toy();
        assert_eq!(vocab.pad_id(), 0);
        assert_eq!(vocab.unk_id(), 1);
        assert_eq!(vocab.bos_id(), 2);
        assert_eq!(vocab.eos_id(), 3);
        assert_eq!(vocab.len(), 6);
    }

    #[test]
    fn test_roundtrip_with_unknown() {
        let vocab = toy();
        let ids = vocab.encode("hello there world");
        assert_eq!(ids, vec![4, 1, 5]);
        assert_eq!(vocab.decode(&ids), "hello <unk> world");
        assert_eq!(vocab.token(999), UNK_TOKEN);
    }

    #[test]
    fn test_missing_special_rejected() {
        let tokens = vec!["<pad>".to_string(), "a".to_string()];
        assert!(matches!(Vocab::from_tokens(tokens), Err(Error::Config(_))));
    }
}
