//! The chat providers parley can talk to.
//!
//! Everything that differs between vendors (endpoint, credentials, role names,
//! model catalogue, error envelope) hangs off [`Provider`] so the rest of the
//! crate picks a provider once and never re-dispatches on a name string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

const MISTRAL_API_URL: &str = "https://api.mistral.ai/v1/";
const OPENAI_API_URL: &str = "https://api.openai.com/v1/";

const MISTRAL_ROLES: &[&str] = &["user", "assistant", "system", "tool"];
const OPENAI_ROLES: &[&str] = &["user", "assistant", "system", "developer", "tool"];

const MISTRAL_MODELS: &[&str] = &[
    "mistral-large-latest",
    "mistral-medium-latest",
    "mistral-small-latest",
    "ministral-8b-latest",
    "ministral-3b-latest",
    "codestral-latest",
    "pixtral-large-latest",
    "open-mistral-nemo",
    "open-mistral-7b",
    "open-mixtral-8x7b",
    "open-mixtral-8x22b",
];

const OPENAI_MODELS: &[&str] = &[
    "gpt-5",
    "gpt-5-mini",
    "gpt-5-nano",
    "gpt-4.1",
    "gpt-4.1-mini",
    "gpt-4.1-nano",
    "gpt-4o",
    "gpt-4o-mini",
    "chatgpt-4o-latest",
    "gpt-4-turbo",
    "gpt-4",
    "gpt-3.5-turbo",
    "o1",
    "o1-mini",
    "o3",
    "o3-mini",
    "o4-mini",
];

/// A remote LLM vendor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Mistral AI (`api.mistral.ai`).
    Mistral,

    /// OpenAI (`api.openai.com`).
    #[serde(rename = "openai")]
    OpenAI,
}

impl Provider {
    /// The lowercase name used on the command line and in stored transcripts.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Mistral => "mistral",
            Provider::OpenAI => "openai",
        }
    }

    /// Base URL of the provider's REST API, with a trailing slash.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Mistral => MISTRAL_API_URL,
            Provider::OpenAI => OPENAI_API_URL,
        }
    }

    /// Full chat-completions endpoint for the default base URL.
    pub fn endpoint_url(&self) -> String {
        format!("{}chat/completions", self.default_base_url())
    }

    /// Environment variable consulted before the key file.
    pub fn key_env_var(&self) -> &'static str {
        match self {
            Provider::Mistral => "MISTRAL_API_KEY",
            Provider::OpenAI => "OPENAI_API_KEY",
        }
    }

    /// File name of the provider's key inside the key directory.
    pub fn key_file_name(&self) -> String {
        format!("{}.key", self.name())
    }

    /// Roles the provider accepts in a chat-completions request.
    pub fn roles(&self) -> &'static [&'static str] {
        match self {
            Provider::Mistral => MISTRAL_ROLES,
            Provider::OpenAI => OPENAI_ROLES,
        }
    }

    /// Returns true if `role` belongs to this provider's role set.
    pub fn accepts_role(&self, role: &str) -> bool {
        self.roles().contains(&role)
    }

    /// Role used for messages typed by the user.
    pub fn user_role(&self) -> &'static str {
        "user"
    }

    /// Role the provider uses for model replies.
    pub fn assistant_role(&self) -> &'static str {
        "assistant"
    }

    /// Models known to work with this provider.
    pub fn known_models(&self) -> &'static [&'static str] {
        match self {
            Provider::Mistral => MISTRAL_MODELS,
            Provider::OpenAI => OPENAI_MODELS,
        }
    }

    /// Returns true if `model` is in the known model list.
    ///
    /// Dated snapshots (`gpt-4o-2024-08-06`) count as known when their family is.
    pub fn is_known_model(&self, model: &str) -> bool {
        self.known_models().iter().any(|known| {
            model == *known
                || model
                    .strip_prefix(known)
                    .is_some_and(|rest| rest.starts_with("-20") || rest.starts_with("-0"))
        })
    }

    /// Model used when the command line does not name one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Mistral => "mistral-small-latest",
            Provider::OpenAI => "gpt-4o-mini",
        }
    }

    /// Parses the JSON error body the provider returns with HTTP status >= 400.
    ///
    /// OpenAI nests the description under `error`; Mistral puts it at the top
    /// level, or under `detail` for 422 validation failures. Bodies that are not
    /// JSON are summarized verbatim.
    pub fn parse_error_envelope(&self, body: &str) -> ErrorEnvelope {
        let parsed = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => map,
            _ => return ErrorEnvelope::raw(body),
        };
        let fields = match self {
            Provider::OpenAI => match parsed.get("error") {
                Some(Value::Object(inner)) => string_fields(inner),
                Some(Value::String(message)) => vec![message.clone()],
                _ => string_fields(&parsed),
            },
            Provider::Mistral => match parsed.get("detail") {
                Some(Value::Array(details)) => details
                    .iter()
                    .filter_map(Value::as_object)
                    .flat_map(string_fields)
                    .collect(),
                Some(Value::String(detail)) => vec![detail.clone()],
                _ => string_fields(&parsed)
                    .into_iter()
                    .filter(|field| field != "error")
                    .collect(),
            },
        };
        let error_type = match self {
            Provider::OpenAI => parsed.get("error").and_then(|e| e.get("type")),
            Provider::Mistral => parsed.get("type"),
        }
        .and_then(Value::as_str)
        .map(String::from);
        if fields.is_empty() {
            return ErrorEnvelope::raw(body);
        }
        ErrorEnvelope {
            error_type,
            summary: fields.join(": "),
        }
    }
}

/// The string-valued parts of a provider error body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEnvelope {
    /// The provider's error type, when it sends one.
    pub error_type: Option<String>,
    /// String-valued fields of the envelope joined with `": "`.
    pub summary: String,
}

impl ErrorEnvelope {
    fn raw(body: &str) -> Self {
        let body = body.trim();
        Self {
            error_type: None,
            summary: if body.is_empty() {
                "no error details returned".to_string()
            } else {
                body.to_string()
            },
        }
    }
}

fn string_fields(map: &Map<String, Value>) -> Vec<String> {
    map.values()
        .filter_map(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mistral" => Ok(Provider::Mistral),
            "openai" => Ok(Provider::OpenAI),
            _ => Err(Error::unsupported_provider(s)),
        }
    }
}
