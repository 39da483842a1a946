//! Per-provider token counting.
//!
//! OpenAI counts follow the chat-completions accounting rules on top of a
//! `tiktoken` encoding chosen by model name. Mistral counts encode a one-message
//! instruct request the way Mistral's tokenizers frame it; the vocabulary is
//! approximated with the closest `tiktoken` encoding, so those counts are
//! estimates rather than exact billing figures.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};
use tracing::debug;

use crate::error::{Error, Result};
use crate::provider::Provider;

/// Tokens every chat message costs on top of its content.
pub const MESSAGE_OVERHEAD: i64 = 4;

/// Tokens that prime a reply from the model.
pub const REPLY_PRIMING: i64 = 2;

/// A role that replaces the role token with a name token, saving one token.
pub const NAME_ROLE: &str = "name";

/// Encoding used when the tokenizer does not recognise a supported model.
pub const DEFAULT_ENCODING: Encoding = Encoding::Cl100kBase;

/// Mistral tokenizer used when a model name does not resolve to a version.
pub const DEFAULT_MISTRAL_TOKENIZER: MistralTokenizer = MistralTokenizer::Tekken;

/// Counts tokens for one message the way a provider bills it.
pub trait TokenCounter: Send + Sync {
    /// Returns the token count of `content` sent as `role` to `model`.
    fn count(&self, model: &str, role: &str, content: &str, is_reply: bool) -> Result<u32>;
}

/// Returns the token counter for `provider`.
pub fn counter_for(provider: Provider) -> &'static dyn TokenCounter {
    match provider {
        Provider::OpenAI => &TiktokenCounter,
        Provider::Mistral => &MistralCounter,
    }
}

/// Counts the tokens of one message for `provider`.
pub fn count_tokens(
    provider: Provider,
    model: &str,
    role: &str,
    content: &str,
    is_reply: bool,
) -> Result<u32> {
    counter_for(provider).count(model, role, content, is_reply)
}

///////////////////////////////////////////// BPE /////////////////////////////////////////////

/// A `tiktoken` byte-pair encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// GPT-4o and later.
    O200kBase,
    /// GPT-4 and GPT-3.5.
    Cl100kBase,
    /// Codex-era models.
    P50kBase,
    /// GPT-3-era models.
    R50kBase,
}

static O200K_BASE: OnceLock<CoreBPE> = OnceLock::new();
static CL100K_BASE: OnceLock<CoreBPE> = OnceLock::new();
static P50K_BASE: OnceLock<CoreBPE> = OnceLock::new();
static R50K_BASE: OnceLock<CoreBPE> = OnceLock::new();

impl Encoding {
    /// The encoding's canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::O200kBase => "o200k_base",
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::P50kBase => "p50k_base",
            Encoding::R50kBase => "r50k_base",
        }
    }

    /// Resolves the encoding for a model, falling back to [`DEFAULT_ENCODING`].
    ///
    /// `tiktoken` releases lag new model launches, so an unrecognised name is
    /// not an error here.
    pub fn for_model(model: &str) -> Self {
        match get_tokenizer(model) {
            Some(Tokenizer::O200kBase) => Encoding::O200kBase,
            Some(Tokenizer::Cl100kBase) => Encoding::Cl100kBase,
            Some(Tokenizer::P50kBase) | Some(Tokenizer::P50kEdit) => Encoding::P50kBase,
            Some(Tokenizer::R50kBase) => Encoding::R50kBase,
            _ => {
                debug!(
                    model,
                    fallback = DEFAULT_ENCODING.name(),
                    "tokenizer does not know model; using fallback encoding"
                );
                DEFAULT_ENCODING
            }
        }
    }

    /// Number of tokens in `text`, treating special-token text as ordinary text.
    pub fn encode_len(&self, text: &str) -> Result<usize> {
        Ok(self.bpe()?.encode_ordinary(text).len())
    }

    fn bpe(&self) -> Result<&'static CoreBPE> {
        let cell = match self {
            Encoding::O200kBase => &O200K_BASE,
            Encoding::Cl100kBase => &CL100K_BASE,
            Encoding::P50kBase => &P50K_BASE,
            Encoding::R50kBase => &R50K_BASE,
        };
        if let Some(bpe) = cell.get() {
            return Ok(bpe);
        }
        let loaded = match self {
            Encoding::O200kBase => tiktoken_rs::o200k_base(),
            Encoding::Cl100kBase => tiktoken_rs::cl100k_base(),
            Encoding::P50kBase => tiktoken_rs::p50k_base(),
            Encoding::R50kBase => tiktoken_rs::r50k_base(),
        }
        .map_err(|e| Error::encoding(format!("failed to load {}: {e}", self.name()), None))?;
        Ok(cell.get_or_init(|| loaded))
    }
}

/// OpenAI chat-completions accounting.
pub struct TiktokenCounter;

impl TokenCounter for TiktokenCounter {
    fn count(&self, model: &str, role: &str, content: &str, is_reply: bool) -> Result<u32> {
        if !Provider::OpenAI.is_known_model(model) {
            return Err(Error::unsupported_model(Provider::OpenAI, model));
        }
        let encoding = Encoding::for_model(model);
        let mut tokens = encoding.encode_len(content)? as i64 + MESSAGE_OVERHEAD;
        if is_reply {
            tokens += REPLY_PRIMING;
        }
        if role == NAME_ROLE {
            tokens -= 1;
        }
        Ok(tokens.max(0) as u32)
    }
}

/////////////////////////////////////////// Mistral ///////////////////////////////////////////

/// The generations of Mistral's tokenizer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MistralTokenizer {
    /// SentencePiece with textual `[INST]` markers.
    V1,
    /// SentencePiece with `[INST]` control tokens.
    V3,
    /// Tiktoken-based "tekken" vocabulary.
    Tekken,
}

const V1_MODELS: &[&str] = &["open-mistral-7b", "open-mixtral-8x7b", "mistral-tiny"];
const V3_MODELS: &[&str] = &[
    "open-mixtral-8x22b",
    "codestral-22b",
    "mistral-large-2402",
    "mistral-large-2407",
    "mistral-small-2402",
];
const TEKKEN_FAMILIES: &[&str] = &[
    "mistral-large",
    "mistral-medium",
    "mistral-small",
    "ministral",
    "codestral",
    "pixtral",
    "open-mistral-nemo",
    "mistral-nemo",
    "magistral",
    "devstral",
];

impl MistralTokenizer {
    /// Resolves the tokenizer for a model, falling back to [`DEFAULT_MISTRAL_TOKENIZER`].
    pub fn for_model(model: &str) -> Self {
        if V1_MODELS.iter().any(|m| model.starts_with(m)) {
            MistralTokenizer::V1
        } else if V3_MODELS.iter().any(|m| model.starts_with(m)) {
            MistralTokenizer::V3
        } else if TEKKEN_FAMILIES.iter().any(|m| model.starts_with(m)) {
            MistralTokenizer::Tekken
        } else {
            debug!(
                model,
                "mistral tokenizer does not know model; using default tokenizer"
            );
            DEFAULT_MISTRAL_TOKENIZER
        }
    }

    fn encoding(&self) -> Encoding {
        match self {
            MistralTokenizer::V1 | MistralTokenizer::V3 => Encoding::Cl100kBase,
            MistralTokenizer::Tekken => Encoding::O200kBase,
        }
    }

    /// Encodes `<s>[INST] content [/INST]` and returns its length.
    pub fn encode_request_len(&self, content: &str) -> Result<usize> {
        const BOS: usize = 1;
        match self {
            MistralTokenizer::V1 => {
                let framed = format!("[INST] {content} [/INST]");
                Ok(BOS + self.encoding().encode_len(&framed)?)
            }
            MistralTokenizer::V3 | MistralTokenizer::Tekken => {
                const INST_CONTROL_TOKENS: usize = 2;
                Ok(BOS + INST_CONTROL_TOKENS + self.encoding().encode_len(content)?)
            }
        }
    }
}

/// Mistral request-shaped accounting.
pub struct MistralCounter;

impl TokenCounter for MistralCounter {
    fn count(&self, model: &str, _role: &str, content: &str, _is_reply: bool) -> Result<u32> {
        let tokenizer = MistralTokenizer::for_model(model);
        Ok(tokenizer.encode_request_len(content)? as u32)
    }
}
