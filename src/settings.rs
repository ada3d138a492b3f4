use crate::store::{KvStore, SETTING_KEY, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_MAX_HISTORY_MESSAGES: usize = 10;

/// Provider configuration actually used for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptSetting {
    pub api_key: String,
    pub model: String,
    pub max_history_messages: usize,
}

impl Default for GptSetting {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            max_history_messages: DEFAULT_MAX_HISTORY_MESSAGES,
        }
    }
}

/// Per-user overrides; empty or zero fields inherit the global value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSetting {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_history_messages: usize,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, String>,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// Merges a user's overrides over the global setting into a fresh value.
///
/// An override model only counts when the user also brings an API key.
pub fn resolve(global: &GptSetting, user: Option<&UserSetting>) -> GptSetting {
    let mut effective = global.clone();
    let Some(user) = user else {
        return effective;
    };
    if !user.api_key.is_empty() {
        effective.api_key = user.api_key.clone();
        if !user.model.is_empty() {
            effective.model = user.model.clone();
        }
    }
    if user.max_history_messages > 0 {
        effective.max_history_messages = user.max_history_messages;
    }
    effective
}

#[derive(Clone)]
pub struct SettingsStore {
    current: Arc<RwLock<GptSetting>>,
    kv: Arc<dyn KvStore>,
}

impl SettingsStore {
    /// Loads the stored global setting, persisting `defaults` when none exists yet.
    pub async fn load(kv: Arc<dyn KvStore>, defaults: GptSetting) -> Result<Self, StoreError> {
        let current = match kv.get(SETTING_KEY).await? {
            Some(raw) => {
                let setting: GptSetting = serde_json::from_str(&raw)
                    .map_err(|err| StoreError::new(format!("setting_decode_failed: {err}")))?;
                tracing::info!(model = %setting.model, "loaded global setting");
                setting
            }
            None => {
                tracing::warn!(model = %defaults.model, "no stored setting, seeding defaults");
                store_setting(kv.as_ref(), &defaults).await?;
                defaults
            }
        };
        Ok(Self {
            current: Arc::new(RwLock::new(current)),
            kv,
        })
    }

    pub async fn snapshot(&self) -> GptSetting {
        self.current.read().await.clone()
    }

    /// Replaces the global setting and writes it through to the store.
    pub async fn update(&self, setting: GptSetting) -> Result<GptSetting, StoreError> {
        let mut guard = self.current.write().await;
        store_setting(self.kv.as_ref(), &setting).await?;
        *guard = setting.clone();
        Ok(setting)
    }

    pub async fn resolve_for(&self, user: Option<&UserSetting>) -> GptSetting {
        let global = self.current.read().await;
        resolve(&global, user)
    }
}

async fn store_setting(kv: &dyn KvStore, setting: &GptSetting) -> Result<(), StoreError> {
    let raw = serde_json::to_string(setting)
        .map_err(|err| StoreError::new(format!("setting_encode_failed: {err}")))?;
    kv.set(SETTING_KEY, &raw, true).await
}
