use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::backend::{PieceState, TokenId, Vocabulary};
use crate::errors::RuntimeError;

/// Slack added to the first tokenize attempt before the exact size is known.
pub(crate) const TOKENIZE_SLACK: usize = 32;

const END_OF_GENERATION_MARKERS: [&str; 5] = [
    "</s>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
    "<|endoftext|>",
];

pub(crate) fn resolve_tokenizer_path(model_path: &str, tokenizer_hint: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(hint) = tokenizer_hint {
        if hint.exists() {
            return Some(hint);
        }
    }

    let model_path = Path::new(model_path);
    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    let local_tok_path = parent_dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let root_tok_path = Path::new("tokenizer.json");
    if root_tok_path.exists() {
        return Some(root_tok_path.to_path_buf());
    }

    let models_tok_path = Path::new("models").join("tokenizer.json");
    if models_tok_path.exists() {
        return Some(models_tok_path);
    }

    None
}

/// Every end marker the vocabulary knows about. At least one must exist or
/// generation could never stop on its own.
pub(crate) fn resolve_end_of_generation(tokenizer: &Tokenizer) -> Result<Vec<TokenId>, String> {
    let ids: Vec<TokenId> = END_OF_GENERATION_MARKERS
        .iter()
        .filter_map(|marker| tokenizer.token_to_id(marker))
        .collect();
    if ids.is_empty() {
        return Err(format!(
            "Tokenizer/model incompatibility: no end-of-generation marker found (expected one of {}).",
            END_OF_GENERATION_MARKERS.join(", ")
        ));
    }
    Ok(ids)
}

pub(crate) struct TokenizerVocab {
    tokenizer: Tokenizer,
    end_of_generation: Vec<TokenId>,
}

impl TokenizerVocab {
    pub(crate) fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| RuntimeError::Tokenizer(e.to_string()))?;
        Self::from_tokenizer(tokenizer)
    }

    pub(crate) fn from_tokenizer(tokenizer: Tokenizer) -> Result<Self, RuntimeError> {
        let end_of_generation = resolve_end_of_generation(&tokenizer).map_err(RuntimeError::Tokenizer)?;
        Ok(Self {
            tokenizer,
            end_of_generation,
        })
    }
}

impl Vocabulary for TokenizerVocab {
    fn tokenize_into(&self, text: &str, add_special: bool, out: &mut [TokenId]) -> Result<usize, RuntimeError> {
        let encoding = self
            .tokenizer
            .encode(text, add_special)
            .map_err(|e| RuntimeError::Tokenizer(e.to_string()))?;
        let ids = encoding.get_ids();
        if ids.len() > out.len() {
            return Err(RuntimeError::BufferTooSmall { required: ids.len() });
        }
        out[..ids.len()].copy_from_slice(ids);
        Ok(ids.len())
    }

    fn step_piece(&self, state: &mut PieceState, token: TokenId) -> Result<Option<String>, RuntimeError> {
        tokenizers::step_decode_stream(
            &*self.tokenizer,
            vec![token],
            true,
            &mut state.ids,
            &mut state.prefix,
            &mut state.prefix_index,
        )
        .map_err(|e| RuntimeError::Tokenizer(e.to_string()))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.end_of_generation.contains(&token)
    }

    fn n_tokens(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

/// Tokenizes with a first guess of `text.len() + TOKENIZE_SLACK` slots and one
/// retry at the exact size the vocabulary reports.
pub(crate) fn tokenize(vocab: &dyn Vocabulary, text: &str, add_special: bool) -> Result<Vec<TokenId>, RuntimeError> {
    let mut buf = vec![0; text.len() + TOKENIZE_SLACK];
    match vocab.tokenize_into(text, add_special, &mut buf) {
        Ok(n) => {
            buf.truncate(n);
            Ok(buf)
        }
        Err(RuntimeError::BufferTooSmall { required }) => {
            buf.resize(required, 0);
            let n = vocab.tokenize_into(text, add_special, &mut buf)?;
            buf.truncate(n);
            Ok(buf)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use tokenizers::Tokenizer;

    use super::{tokenize, TokenizerVocab};
    use crate::backend::{PieceState, Vocabulary};
    use crate::testing::ToyVocab;

    /// Byte-level BPE without merges: "é" (0xC3 0xA9) encodes to two ids.
    const BYTE_LEVEL_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 2, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "ByteLevel", "add_prefix_space": false, "trim_offsets": true, "use_regex": true},
        "post_processor": null,
        "decoder": {"type": "ByteLevel", "add_prefix_space": true, "trim_offsets": true, "use_regex": true},
        "model": {"type": "BPE", "dropout": null, "unk_token": null, "continuing_subword_prefix": null,
                  "end_of_word_suffix": null, "fuse_unk": false, "byte_fallback": false,
                  "vocab": {"Ã": 0, "©": 1, "<|endoftext|>": 2}, "merges": []}
    }"#;

    fn byte_level_vocab() -> TokenizerVocab {
        let tokenizer = Tokenizer::from_str(BYTE_LEVEL_TOKENIZER).expect("tokenizer json");
        TokenizerVocab::from_tokenizer(tokenizer).expect("vocab")
    }

    #[test]
    fn split_character_is_emitted_once_complete() {
        let vocab = byte_level_vocab();
        let ids = tokenize(&vocab, "é", false).expect("tokenize");
        assert_eq!(ids, vec![0, 1]);

        let mut state = PieceState::default();
        assert_eq!(vocab.step_piece(&mut state, ids[0]).expect("first byte"), None);
        assert_eq!(
            vocab.step_piece(&mut state, ids[1]).expect("second byte"),
            Some("é".to_string())
        );
    }

    #[test]
    fn repeated_characters_stream_without_replacement_chars() {
        let vocab = byte_level_vocab();
        let mut state = PieceState::default();
        let mut text = String::new();
        for id in [0, 1, 0, 1, 2, 0, 1] {
            if let Some(piece) = vocab.step_piece(&mut state, id).expect("step") {
                text.push_str(&piece);
            }
        }
        assert_eq!(text, "ééé");
        assert!(vocab.is_end_of_generation(2));
    }

    #[test]
    fn tokenize_prepends_bos_only_when_asked() {
        let vocab = ToyVocab::default();
        let with = tokenize(&vocab, "hi", true).expect("tokenize");
        let without = tokenize(&vocab, "hi", false).expect("tokenize");
        assert_eq!(with.len(), without.len() + 1);
        assert_eq!(&with[1..], &without[..]);
    }

    #[test]
    fn tokenize_retries_when_first_guess_is_short() {
        let vocab = ToyVocab {
            expansion: 40,
            ..ToyVocab::default()
        };
        let ids = tokenize(&vocab, "ab", false).expect("tokenize");
        assert_eq!(ids.len(), 80);
    }
}
