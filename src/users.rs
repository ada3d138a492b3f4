use crate::error::RelayError;
use crate::settings::UserSetting;
use crate::store::{KvStore, StoreError, USERS_SET_KEY, user_item_key};
use async_trait::async_trait;
use dashmap::DashMap;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// USD per 1000 total tokens.
pub const DEFAULT_UNIT_PRICE: f64 = 0.002;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub usage: CostUsage,
    /// Derived from `usage.total_tokens` on every update.
    pub cost: f64,
}

impl Cost {
    fn apply(&mut self, usage: &Usage, unit_price: f64) {
        if usage.prompt_tokens > 0 {
            self.usage.prompt_tokens += usage.prompt_tokens as u64;
        }
        if usage.completion_tokens > 0 {
            self.usage.completion_tokens += usage.completion_tokens as u64;
        }
        if usage.total_tokens > 0 {
            self.usage.total_tokens += usage.total_tokens as u64;
        }
        self.cost = price_for(self.usage.total_tokens, unit_price);
    }
}

pub fn price_for(total_tokens: u64, unit_price: f64) -> f64 {
    total_tokens as f64 / 1000.0 * unit_price
}

/// Token counts for one completion, as reported by the provider or estimated locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default, rename = "is_admin", skip_serializing_if = "std::ops::Not::not")]
    pub admin: bool,
    /// Unix seconds; 0 never expires.
    #[serde(default)]
    pub expire_timestamp: i64,
    #[serde(default)]
    pub cost: Cost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting: Option<UserSetting>,
}

impl User {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expire_timestamp > 0 && self.expire_timestamp < now
    }
}

/// Random lowercase hex token of `len` characters.
pub fn generate_user_token(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    OsRng.fill_bytes(&mut bytes);
    let mut token = hex::encode(bytes);
    token.truncate(len);
    token
}

/// Per-user records and their accumulated cost.
///
/// `update_usage` is atomic per user: concurrent calls never lose an increment,
/// and readers never observe a half-applied update.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, token: &str) -> Option<User>;
    async fn list(&self) -> Vec<User>;
    async fn put(&self, user: User) -> Result<(), RelayError>;
    async fn update_usage(&self, token: &str, usage: &Usage) -> Result<Cost, RelayError>;
    /// Applies profile changes without touching the cost counters.
    /// `Ok(None)` when the user does not exist.
    async fn update_profile(
        &self,
        token: &str,
        edit: ProfileEdit,
    ) -> Result<Option<User>, RelayError>;
}

/// Admin-side user edit. Unset, empty or non-positive fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileEdit {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default, rename = "is_admin")]
    pub admin: Option<bool>,
    #[serde(default)]
    pub expire_timestamp: Option<i64>,
    #[serde(default)]
    pub setting: Option<UserSetting>,
}

impl ProfileEdit {
    fn apply(self, user: &mut User) {
        if let Some(admin) = self.admin {
            user.admin = admin;
        }
        if let Some(expire_timestamp) = self.expire_timestamp.filter(|v| *v > 0) {
            user.expire_timestamp = expire_timestamp;
        }
        if let Some(nickname) = self.nickname.filter(|v| !v.is_empty()) {
            user.nickname = nickname;
        }
        if let Some(avatar) = self.avatar.filter(|v| !v.is_empty()) {
            user.avatar = avatar;
        }
        if self.setting.is_some() {
            user.setting = self.setting;
        }
    }
}

#[derive(Clone)]
pub struct UserLedger {
    users: Arc<DashMap<String, Arc<Mutex<User>>>>,
    kv: Arc<dyn KvStore>,
    unit_price: f64,
}

impl UserLedger {
    pub fn new(kv: Arc<dyn KvStore>, unit_price: f64) -> Self {
        Self {
            users: Arc::new(DashMap::new()),
            kv,
            unit_price,
        }
    }

    /// Builds the ledger from every user listed in the store's user set.
    pub async fn load(kv: Arc<dyn KvStore>, unit_price: f64) -> Result<Self, StoreError> {
        let ledger = Self::new(kv, unit_price);
        let tokens = ledger.kv.smembers(USERS_SET_KEY).await?;
        for token in tokens {
            if ledger.users.contains_key(&token) {
                continue;
            }
            let Some(raw) = ledger.kv.get(&user_item_key(&token)).await? else {
                tracing::warn!(token = %token, "user listed in set but record missing");
                continue;
            };
            match serde_json::from_str::<User>(&raw) {
                Ok(mut user) => {
                    user.token = token.clone();
                    tracing::debug!(token = %token, nickname = %user.nickname, "load user");
                    ledger.users.insert(token, Arc::new(Mutex::new(user)));
                }
                Err(err) => tracing::error!(token = %token, "user record decode failed: {err}"),
            }
        }
        tracing::info!(count = ledger.users.len(), "loaded users");
        Ok(ledger)
    }

    fn entry(&self, token: &str) -> Option<Arc<Mutex<User>>> {
        self.users.get(token).map(|slot| slot.value().clone())
    }

    async fn persist(&self, user: &User) -> Result<(), StoreError> {
        let raw = serde_json::to_string(user)
            .map_err(|err| StoreError::new(format!("user_encode_failed: {err}")))?;
        self.kv.set(&user_item_key(&user.token), &raw, true).await
    }
}

#[async_trait]
impl UserRepository for UserLedger {
    async fn get(&self, token: &str) -> Option<User> {
        if token.is_empty() {
            return None;
        }
        let slot = self.entry(token)?;
        let user = slot.lock().await;
        Some(user.clone())
    }

    async fn list(&self) -> Vec<User> {
        let slots: Vec<Arc<Mutex<User>>> =
            self.users.iter().map(|slot| slot.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out.sort_by(|a, b| a.token.cmp(&b.token));
        out
    }

    async fn put(&self, user: User) -> Result<(), RelayError> {
        if user.token.is_empty() {
            return Err(RelayError::Auth);
        }
        let slot = self
            .users
            .entry(user.token.clone())
            .or_insert_with(|| Arc::new(Mutex::new(user.clone())))
            .value()
            .clone();
        let mut guard = slot.lock().await;
        *guard = user;
        self.persist(&guard).await?;
        self.kv.sadd(USERS_SET_KEY, &guard.token).await?;
        Ok(())
    }

    async fn update_usage(&self, token: &str, usage: &Usage) -> Result<Cost, RelayError> {
        let slot = self.entry(token).ok_or(RelayError::Auth)?;
        // only this user's slot is held across the write-through
        let mut guard = slot.lock().await;
        guard.cost.apply(usage, self.unit_price);
        let cost = guard.cost;
        if let Err(err) = self.persist(&guard).await {
            tracing::error!(token = %token, ?usage, "persist user cost failed: {err}");
            return Err(err.into());
        }
        Ok(cost)
    }

    async fn update_profile(
        &self,
        token: &str,
        edit: ProfileEdit,
    ) -> Result<Option<User>, RelayError> {
        let Some(slot) = self.entry(token) else {
            return Ok(None);
        };
        let mut guard = slot.lock().await;
        edit.apply(&mut guard);
        self.persist(&guard).await?;
        Ok(Some(guard.clone()))
    }
}
