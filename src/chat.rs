use crate::auth::authenticate;
use crate::error::RelayError;
use crate::settings::SettingsStore;
use crate::users::{Cost, User, UserRepository};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Caller-supplied chat body. `model` is accepted but never forwarded.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatPayload {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Body sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

/// One unit of the caller-facing response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponseFrame {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub created: i64,
    pub content: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cost: Option<Cost>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl ChatResponseFrame {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn terminal(content: String, created: i64, total_tokens: i64, cost: Cost) -> Self {
        Self {
            done: true,
            created,
            content,
            total_tokens,
            user_cost: Some(cost),
        }
    }
}

/// A request ready for the provider, bound to the user it bills.
#[derive(Debug, Clone)]
pub struct ChatInstance {
    pub user: User,
    pub api_key: String,
    pub request: ChatRequest,
}

pub fn decode_payload(raw: &str) -> Result<ChatPayload, RelayError> {
    serde_json::from_str(raw).map_err(|err| RelayError::InvalidPayload(err.to_string()))
}

/// Keeps the `max_history` most recent messages, never fewer than one.
pub fn truncate_history(mut messages: Vec<ChatMessage>, max_history: usize) -> Vec<ChatMessage> {
    let keep = max_history.clamp(1, messages.len().max(1));
    let skip = messages.len().saturating_sub(keep);
    messages.drain(..skip);
    messages
}

/// Authenticates the caller and turns the raw payload into a provider request.
pub async fn assemble(
    users: &dyn UserRepository,
    settings: &SettingsStore,
    token: &str,
    raw_payload: &str,
    stream: bool,
    now: i64,
) -> Result<ChatInstance, RelayError> {
    let user = authenticate(users, token, now).await?;
    let payload = decode_payload(raw_payload)?;
    if payload.messages.is_empty() {
        return Err(RelayError::EmptyContent);
    }
    tracing::debug!(
        token = %user.token,
        messages = payload.messages.len(),
        requested_model = ?payload.model,
        "received chat payload"
    );

    let effective = settings.resolve_for(user.setting.as_ref()).await;
    let messages = truncate_history(payload.messages, effective.max_history_messages);
    Ok(ChatInstance {
        user,
        api_key: effective.api_key,
        request: ChatRequest {
            model: effective.model,
            messages,
            stream,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{GptSetting, UserSetting};
    use crate::store::{KvStore, MemoryKvStore};
    use crate::users::{DEFAULT_UNIT_PRICE, UserLedger};
    use serde_json::json;
    use std::sync::Arc;

    fn messages(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| ChatMessage {
                role: "user".to_string(),
                content: format!("m{i}"),
                name: None,
            })
            .collect()
    }

    async fn fixture(user: User, max_history: usize) -> (UserLedger, SettingsStore) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let ledger = UserLedger::new(kv.clone(), DEFAULT_UNIT_PRICE);
        ledger.put(user).await.unwrap();
        let settings = SettingsStore::load(
            kv,
            GptSetting {
                api_key: "sk-global".to_string(),
                model: "gpt-3.5-turbo".to_string(),
                max_history_messages: max_history,
            },
        )
        .await
        .unwrap();
        (ledger, settings)
    }

    fn payload(n: usize, model: Option<&str>) -> String {
        json!({ "messages": messages(n), "model": model }).to_string()
    }

    #[test]
    fn truncation_keeps_most_recent_in_order() {
        for len in 1..6usize {
            for max in 0..8usize {
                let out = truncate_history(messages(len), max);
                assert_eq!(out.len(), max.max(1).min(len));
                assert_eq!(out.last().unwrap().content, format!("m{}", len - 1));
                let first = len - out.len();
                for (offset, message) in out.iter().enumerate() {
                    assert_eq!(message.content, format!("m{}", first + offset));
                }
            }
        }
    }

    #[tokio::test]
    async fn assembles_truncated_request_with_forced_model() {
        let user = User {
            token: "abc".to_string(),
            ..Default::default()
        };
        let (ledger, settings) = fixture(user, 2).await;
        let instance = assemble(&ledger, &settings, "abc", &payload(5, Some("gpt-4")), false, 0)
            .await
            .unwrap();
        assert_eq!(instance.request.model, "gpt-3.5-turbo");
        assert_eq!(instance.api_key, "sk-global");
        assert_eq!(instance.request.messages, messages(5)[3..5].to_vec());
        assert!(!instance.request.stream);
    }

    #[tokio::test]
    async fn user_key_and_model_override_global() {
        let user = User {
            token: "abc".to_string(),
            setting: Some(UserSetting {
                api_key: "sk-user".to_string(),
                model: "gpt-4".to_string(),
                max_history_messages: 1,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (ledger, settings) = fixture(user, 10).await;
        let instance = assemble(&ledger, &settings, "abc", &payload(3, None), true, 0)
            .await
            .unwrap();
        assert_eq!(instance.api_key, "sk-user");
        assert_eq!(instance.request.model, "gpt-4");
        assert_eq!(instance.request.messages.len(), 1);
        assert_eq!(settings.snapshot().await.model, "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn rejects_empty_messages_and_bad_json() {
        let user = User {
            token: "abc".to_string(),
            ..Default::default()
        };
        let (ledger, settings) = fixture(user, 2).await;
        assert!(matches!(
            assemble(&ledger, &settings, "abc", &payload(0, None), false, 0).await,
            Err(RelayError::EmptyContent)
        ));
        assert!(matches!(
            assemble(&ledger, &settings, "abc", "{not json", false, 0).await,
            Err(RelayError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn expired_user_is_rejected_before_anything_else() {
        let now = 1_700_000_000;
        let user = User {
            token: "abc".to_string(),
            expire_timestamp: now - 3600,
            ..Default::default()
        };
        let (ledger, settings) = fixture(user, 2).await;
        assert!(matches!(
            assemble(&ledger, &settings, "abc", &payload(1, None), false, now).await,
            Err(RelayError::LicenseExpired)
        ));
        let stored = ledger.get("abc").await.unwrap();
        assert_eq!(stored.cost, Cost::default());
    }

    #[test]
    fn frames_omit_empty_fields() {
        let chunk = serde_json::to_value(ChatResponseFrame::chunk("hi")).unwrap();
        assert_eq!(chunk, json!({ "content": "hi" }));

        let done = serde_json::to_value(ChatResponseFrame::terminal(
            String::new(),
            0,
            15,
            Cost::default(),
        ))
        .unwrap();
        assert_eq!(done["done"], true);
        assert_eq!(done["total_tokens"], 15);
        assert!(done.get("created").is_none());
        assert!(done["user_cost"].is_object());
    }
}
