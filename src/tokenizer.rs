//! Token estimation for billing.
//!
//! Estimation never fails a request: models without a known encoding count as
//! zero tokens, and models without known chat overheads use the gpt-4 ones.

use crate::chat::ChatMessage;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Turbo35,
    Gpt4,
    Unknown,
}

impl ModelFamily {
    pub fn of(model: &str) -> Self {
        match model {
            "gpt-3.5-turbo" | "gpt-3.5-turbo-0301" => Self::Turbo35,
            "gpt-4" | "gpt-4-0314" => Self::Gpt4,
            _ => Self::Unknown,
        }
    }

    /// `(tokens_per_message, tokens_per_name)`.
    fn overheads(self) -> (i64, i64) {
        match self {
            Self::Turbo35 => (4, -1),
            Self::Gpt4 | Self::Unknown => (3, 1),
        }
    }
}

fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    let tokenizer = get_tokenizer(model)?;
    Some(match tokenizer {
        Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        Tokenizer::R50kBase | Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    })
}

fn encoded_len(bpe: &CoreBPE, text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    // provider bills special-token markup in caller text as plain text
    bpe.encode_ordinary(text).len() as i64
}

pub fn count_tokens(text: &str, model: &str) -> i64 {
    let Some(bpe) = bpe_for_model(model) else {
        tracing::error!(model = %model, "no token encoding for model");
        return 0;
    };
    encoded_len(bpe, text)
}

pub fn count_message_tokens(messages: &[ChatMessage], model: &str) -> i64 {
    let Some(bpe) = bpe_for_model(model) else {
        tracing::error!(model = %model, "no token encoding for model");
        return 0;
    };
    let family = ModelFamily::of(model);
    if family == ModelFamily::Unknown {
        tracing::warn!(model = %model, "model family not found, using gpt-4 overheads");
    }
    let (per_message, per_name) = family.overheads();

    let mut tokens = 0;
    for message in messages {
        let name = message.name.as_deref().unwrap_or("");
        tokens += per_message
            + encoded_len(bpe, &message.content)
            + encoded_len(bpe, &message.role)
            + encoded_len(bpe, name);
        if !name.is_empty() {
            tokens += per_name;
        }
    }
    tokens + REPLY_PRIMING_TOKENS
}

/// Loads the common encodings outside the request path.
pub fn preload() {
    let _ = tiktoken_rs::cl100k_base_singleton();
}
