//! Prompt tokenization for the CLIP text encoder

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tokenizers::Tokenizer;
use tracing::warn;

use crate::error::{Error, Result};

/// Default sequence length of CLIP text encoders
pub const DEFAULT_MAX_LENGTH: usize = 77;

/// Special tokens bracketing and padding each prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialTokens {
    /// Start-of-text token
    pub bos: String,
    /// End-of-text token
    pub eos: String,
    /// Padding token
    pub pad: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: "<|startoftext|>".to_string(),
            eos: "<|endoftext|>".to_string(),
            pad: "<|endoftext|>".to_string(),
        }
    }
}

/// File name of the special-token map next to `tokenizer.json`
pub const SPECIAL_TOKENS_MAP: &str = "special_tokens_map.json";

impl SpecialTokens {
    /// Read a `special_tokens_map.json`.
    ///
    /// Entries may be plain strings or `{"content": ...}` objects; missing
    /// entries keep their defaults.
    pub fn from_special_tokens_map(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let map: serde_json::Value = serde_json::from_str(&content)?;
        let entry = |key: &str| match map.get(key) {
            Some(serde_json::Value::String(token)) => Some(token.clone()),
            Some(value) => value
                .get("content")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            None => None,
        };

        let defaults = Self::default();
        Ok(Self {
            bos: entry("bos_token").unwrap_or(defaults.bos),
            eos: entry("eos_token").unwrap_or(defaults.eos),
            pad: entry("pad_token").unwrap_or(defaults.pad),
        })
    }

    fn to_special_tokens_map(&self) -> serde_json::Value {
        serde_json::json!({
            "bos_token": self.bos,
            "eos_token": self.eos,
            "pad_token": self.pad,
        })
    }
}

/// Fixed-length prompt tokenizer
///
/// Prompts are encoded without the library's own post-processing, then
/// bracketed with BOS/EOS, truncated to `max_length` (EOS is always kept)
/// and right-padded with the pad token.
#[derive(Debug, Clone)]
pub struct PromptTokenizer {
    inner: Tokenizer,
    special: SpecialTokens,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
    max_length: usize,
}

impl PromptTokenizer {
    /// Wrap a loaded tokenizer
    pub fn new(inner: Tokenizer, special: &SpecialTokens, max_length: usize) -> Result<Self> {
        if max_length < 2 {
            return Err(Error::tokenizer(format!(
                "max_length {max_length} leaves no room for BOS and EOS"
            )));
        }
        let id = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| Error::tokenizer(format!("token {token:?} is not in the vocabulary")))
        };
        let bos_id = id(&special.bos)?;
        let eos_id = id(&special.eos)?;
        let pad_id = id(&special.pad)?;
        Ok(Self {
            inner,
            special: special.clone(),
            bos_id,
            eos_id,
            pad_id,
            max_length,
        })
    }

    /// Load a `tokenizer.json`
    pub fn from_file(path: impl AsRef<Path>, special: &SpecialTokens, max_length: usize) -> Result<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path)
            .map_err(|e| Error::tokenizer(format!("failed to load {}: {e}", path.display())))?;
        Self::new(inner, special, max_length)
    }

    /// Parse a serialized `tokenizer.json`
    pub fn from_json(json: &str, special: &SpecialTokens, max_length: usize) -> Result<Self> {
        let inner = Tokenizer::from_str(json).map_err(|e| Error::tokenizer(e.to_string()))?;
        Self::new(inner, special, max_length)
    }

    /// Tiny lowercase word-level tokenizer for offline tests.
    ///
    /// Ids 0, 1 and 2 are BOS, pad and EOS; unknown words map to `<unk>`.
    pub fn dummy() -> Result<Self> {
        let mut vocab = serde_json::Map::new();
        let specials = ["<|startoftext|>", "<pad>", "<|endoftext|>", "<unk>"];
        for (id, token) in specials.iter().chain(DUMMY_WORDS.iter()).enumerate() {
            vocab.insert((*token).to_string(), serde_json::Value::from(id));
        }
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": { "type": "Lowercase" },
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        let special = SpecialTokens {
            pad: "<pad>".to_string(),
            ..Default::default()
        };
        Self::from_json(&json.to_string(), &special, DEFAULT_MAX_LENGTH)
    }

    /// Write `tokenizer.json` and `special_tokens_map.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.inner
            .save(dir.join("tokenizer.json"), true)
            .map_err(|e| Error::tokenizer(format!("failed to save {}: {e}", dir.display())))?;
        let map = serde_json::to_string_pretty(&self.special.to_special_tokens_map())?;
        std::fs::write(dir.join(SPECIAL_TOKENS_MAP), map)?;
        Ok(())
    }

    /// Special tokens this tokenizer brackets and pads with
    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    /// Padded sequence length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Start-of-text id
    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    /// End-of-text id
    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Padding id
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Token ids of `prompt`, exactly `max_length` long
    pub fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(prompt, false)
            .map_err(|e| Error::tokenizer(e.to_string()))?;
        let body = encoding.get_ids();
        let room = self.max_length - 2;
        if body.len() > room {
            warn!(
                dropped = body.len() - room,
                max_length = self.max_length,
                "prompt truncated"
            );
        }

        let mut ids = Vec::with_capacity(self.max_length);
        ids.push(self.bos_id);
        ids.extend_from_slice(&body[..body.len().min(room)]);
        ids.push(self.eos_id);
        ids.resize(self.max_length, self.pad_id);
        Ok(ids)
    }

    /// `(prompts.len(), max_length)` tensor of token ids
    pub fn encode_batch<S: AsRef<str>>(&self, prompts: &[S], device: &Device) -> Result<Tensor> {
        let ids = prompts
            .iter()
            .map(|p| self.encode(p.as_ref()))
            .collect::<Result<Vec<_>>>()?
            .concat();
        Ok(Tensor::from_vec(ids, (prompts.len(), self.max_length), device)?)
    }
}

const DUMMY_WORDS: &[&str] = &[
    "a", "an", "the", "of", "and", "in", "on", "with", "at", "by", "painting", "photograph", "photo",
    "picture", "drawing", "portrait", "squirrel", "cat", "dog", "horse", "astronaut", "bird", "eating",
    "riding", "sitting", "running", "burger", "apple", "pizza", "tree", "forest", "city", "mountain",
    "beach", "sky", "moon", "space", "red", "blue", "green", "small", "large", "beautiful", "old",
    "new", ",", ".",
];
