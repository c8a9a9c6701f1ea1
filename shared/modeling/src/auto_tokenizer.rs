use std::{io, path::PathBuf};
use thiserror::Error;
use tokenizers::{AddedToken, Tokenizer};
use tracing::info;

pub const DEFAULT_PAD_TOKEN: &str = "[PAD]";
pub const DEFAULT_EOS_TOKEN: &str = "</s>";
pub const DEFAULT_BOS_TOKEN: &str = "<s>";
pub const DEFAULT_UNK_TOKEN: &str = "<unk>";

#[derive(Error, Debug)]
pub enum AutoTokenizerError {
    #[error("Failed to load tokenizer from tokenizer.json")]
    CouldntLoadTokenizer(#[from] tokenizers::Error),

    #[error("Could not find tokenizer.json")]
    FileNotFound,

    #[error("failed to read {0}: {1}")]
    FailedToReadConfig(PathBuf, io::Error),

    #[error("could not parse {0}: {1}")]
    FailedToParseConfig(PathBuf, serde_json::Error),

    #[error("special token {0} has no id in the tokenizer")]
    MissingTokenId(String),
}

pub fn auto_tokenizer(repo_files: &[PathBuf]) -> Result<Tokenizer, AutoTokenizerError> {
    match repo_files.iter().find(|x| x.ends_with("tokenizer.json")) {
        Some(path) => Ok(Tokenizer::from_file(path.as_path())?),
        None => Err(AutoTokenizerError::FileNotFound),
    }
}

/// Tokens in `tokenizer_config.json` are either plain strings or
/// `{"content": "...", ...}` objects.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
enum TokenSpec {
    Plain(String),
    Added { content: String },
}

impl From<TokenSpec> for String {
    fn from(value: TokenSpec) -> Self {
        match value {
            TokenSpec::Plain(content) | TokenSpec::Added { content } => content,
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct SpecialTokensFile {
    pad_token: Option<TokenSpec>,
    eos_token: Option<TokenSpec>,
    bos_token: Option<TokenSpec>,
    unk_token: Option<TokenSpec>,
}

/// The pad/eos/bos/unk tokens a tokenizer declares, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad_token: Option<String>,
    pub eos_token: Option<String>,
    pub bos_token: Option<String>,
    pub unk_token: Option<String>,
}

impl SpecialTokensFile {
    fn read(path: &PathBuf) -> Result<Self, AutoTokenizerError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AutoTokenizerError::FailedToReadConfig(path.clone(), e))?;
        serde_json::from_str(&contents)
            .map_err(|e| AutoTokenizerError::FailedToParseConfig(path.clone(), e))
    }

    /// Keeps `self`'s tokens, taking the ones it lacks from `fallback`.
    fn or(self, fallback: Self) -> Self {
        Self {
            pad_token: self.pad_token.or(fallback.pad_token),
            eos_token: self.eos_token.or(fallback.eos_token),
            bos_token: self.bos_token.or(fallback.bos_token),
            unk_token: self.unk_token.or(fallback.unk_token),
        }
    }
}

impl SpecialTokens {
    /// Reads `tokenizer_config.json` and `special_tokens_map.json`, token by
    /// token, preferring the former. Files the repo lacks declare nothing.
    pub fn from_repo_files(repo_files: &[PathBuf]) -> Result<Self, AutoTokenizerError> {
        let mut file = SpecialTokensFile::default();
        for name in ["tokenizer_config.json", "special_tokens_map.json"] {
            if let Some(path) = repo_files.iter().find(|x| x.ends_with(name)) {
                file = file.or(SpecialTokensFile::read(path)?);
            }
        }
        Ok(Self {
            pad_token: file.pad_token.map(String::from),
            eos_token: file.eos_token.map(String::from),
            bos_token: file.bos_token.map(String::from),
            unk_token: file.unk_token.map(String::from),
        })
    }
}

/// Ids of the special tokens after [`ensure_special_tokens`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokenIds {
    pub pad: i64,
    pub eos: i64,
    pub bos: i64,
    pub unk: i64,
}

/// Fills every missing special token with its default placeholder and registers
/// all four with the tokenizer as special tokens (so decoding can skip them).
/// Returns the resolved ids and how many entries the vocabulary grew by.
pub fn ensure_special_tokens(
    tokenizer: &mut Tokenizer,
    declared: &SpecialTokens,
) -> Result<(SpecialTokenIds, usize), AutoTokenizerError> {
    let pad = declared
        .pad_token
        .clone()
        .or_else(|| tokenizer.get_padding().map(|x| x.pad_token.clone()))
        .unwrap_or_else(|| DEFAULT_PAD_TOKEN.to_owned());
    let eos = declared
        .eos_token
        .clone()
        .unwrap_or_else(|| DEFAULT_EOS_TOKEN.to_owned());
    let bos = declared
        .bos_token
        .clone()
        .unwrap_or_else(|| DEFAULT_BOS_TOKEN.to_owned());
    let unk = declared
        .unk_token
        .clone()
        .unwrap_or_else(|| DEFAULT_UNK_TOKEN.to_owned());

    let before = tokenizer.get_vocab_size(true);
    tokenizer.add_special_tokens(
        &[&pad, &eos, &bos, &unk]
            .into_iter()
            .map(|x| AddedToken::from(x.clone(), true))
            .collect::<Vec<_>>(),
    );
    let added = tokenizer.get_vocab_size(true).saturating_sub(before);
    if added > 0 {
        info!("Added {added} special tokens to the tokenizer");
    }

    let id = |token: &str| {
        tokenizer
            .token_to_id(token)
            .map(|x| x as i64)
            .ok_or_else(|| AutoTokenizerError::MissingTokenId(token.to_owned()))
    };
    let ids = SpecialTokenIds {
        pad: id(&pad)?,
        eos: id(&eos)?,
        bos: id(&bos)?,
        unk: id(&unk)?,
    };
    Ok((ids, added))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;

    fn word_level(vocab: &[&str]) -> Tokenizer {
        let vocab = vocab
            .iter()
            .enumerate()
            .map(|(i, x)| (x.to_string(), i as u32))
            .collect::<HashMap<_, _>>();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_owned())
            .build()
            .unwrap();
        Tokenizer::new(model)
    }

    #[test]
    fn test_reads_plain_and_object_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer_config.json");
        std::fs::write(
            &path,
            r#"{
                "bos_token": {"content": "<s>", "lstrip": false},
                "eos_token": "</s>",
                "pad_token": null,
                "model_max_length": 4096
            }"#,
        )
        .unwrap();

        let tokens = SpecialTokens::from_repo_files(&[path]).unwrap();
        assert_eq!(
            tokens,
            SpecialTokens {
                pad_token: None,
                eos_token: Some("</s>".to_owned()),
                bos_token: Some("<s>".to_owned()),
                unk_token: None,
            }
        );
    }

    #[test]
    fn test_special_tokens_map_fills_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("tokenizer_config.json");
        std::fs::write(&config, r#"{"eos_token": "</s>", "bos_token": "<s>"}"#).unwrap();
        let map = dir.path().join("special_tokens_map.json");
        std::fs::write(
            &map,
            r#"{"eos_token": "<|end|>", "pad_token": "<pad>", "unk_token": {"content": "<unk>"}}"#,
        )
        .unwrap();

        let tokens = SpecialTokens::from_repo_files(&[map, config]).unwrap();
        assert_eq!(
            tokens,
            SpecialTokens {
                pad_token: Some("<pad>".to_owned()),
                eos_token: Some("</s>".to_owned()),
                bos_token: Some("<s>".to_owned()),
                unk_token: Some("<unk>".to_owned()),
            }
        );

        let mut tokenizer = word_level(&["<unk>", "<s>", "</s>", "<pad>"]);
        let (ids, added) = ensure_special_tokens(&mut tokenizer, &tokens).unwrap();
        assert_eq!(added, 0);
        assert_eq!(ids.pad, 3);
    }

    #[test]
    fn test_missing_pad_is_added() {
        let mut tokenizer = word_level(&["<unk>", "<s>", "</s>", "hello"]);
        let declared = SpecialTokens {
            pad_token: None,
            eos_token: Some("</s>".to_owned()),
            bos_token: Some("<s>".to_owned()),
            unk_token: Some("<unk>".to_owned()),
        };
        let (ids, added) = ensure_special_tokens(&mut tokenizer, &declared).unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            ids,
            SpecialTokenIds {
                pad: 4,
                eos: 2,
                bos: 1,
                unk: 0,
            }
        );
        assert_eq!(tokenizer.get_vocab_size(true), 5);
    }

    #[test]
    fn test_nothing_added_when_all_present() {
        let mut tokenizer = word_level(&["<unk>", "<s>", "</s>", "[PAD]"]);
        let (ids, added) = ensure_special_tokens(&mut tokenizer, &SpecialTokens::default()).unwrap();
        assert_eq!(added, 0);
        assert_eq!(ids.pad, 3);
    }
}
