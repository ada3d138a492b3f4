use crate::app::AppState;
use crate::auth::{access_token, authenticate, require_admin};
use crate::chat::assemble;
use crate::error::{AppError, AppResult};
use crate::relay::{self, RelayEvent};
use crate::settings::{GptSetting, UserSetting};
use crate::users::{Cost, ProfileEdit, User, generate_user_token};
use axum::Json;
use axum::extract::{Query, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const NEW_USER_TOKEN_LEN: usize = 32;
const NEW_USER_DEFAULT_TTL_SECS: i64 = 7 * 24 * 3600;

pub const SUPPORTED_MODELS: [&str; 8] = [
    "gpt-4-32k-0314",
    "gpt-4-32k",
    "gpt-4-0314",
    "gpt-4",
    "gpt-3.5-turbo-0301",
    "gpt-3.5-turbo",
    "text-davinci-003",
    "text-davinci-002",
];

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn hello() -> &'static str {
    "hello world"
}

pub async fn list_models() -> Json<Vec<&'static str>> {
    Json(SUPPORTED_MODELS.to_vec())
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Response> {
    let instance = assemble(
        state.users.as_ref(),
        &state.settings,
        access_token(&headers),
        &body,
        false,
        now_ts(),
    )
    .await?;
    let frame = relay::relay_sync(state.provider.as_ref(), state.users.as_ref(), instance).await?;
    Ok(Json(frame).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ChatStreamQuery {
    #[serde(default)]
    pub data: String,
}

pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChatStreamQuery>,
) -> AppResult<Response> {
    let instance = assemble(
        state.users.as_ref(),
        &state.settings,
        access_token(&headers),
        &query.data,
        true,
        now_ts(),
    )
    .await?;
    let opened = relay::open_stream(state.provider.as_ref(), instance).await?;

    let (tx, rx) = mpsc::channel::<RelayEvent>(64);
    tokio::spawn(relay::relay_stream(state.users.clone(), opened, tx));
    let stream =
        ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.into_sse_event()));
    Ok(([(CACHE_CONTROL, "no-cache")], Sse::new(stream)).into_response())
}

pub async fn profile(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<User>> {
    let user = caller(&state, &headers).await?;
    Ok(Json(user))
}

pub async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<User>>> {
    let user = caller(&state, &headers).await?;
    require_admin(&user)?;
    Ok(Json(state.users.list().await))
}

#[derive(Debug, Deserialize)]
pub struct NewUserInput {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default, rename = "is_admin")]
    pub admin: bool,
    #[serde(default)]
    pub expire_timestamp: i64,
    #[serde(default)]
    pub setting: Option<UserSetting>,
}

pub async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewUserInput>,
) -> AppResult<Json<User>> {
    let user = caller(&state, &headers).await?;
    require_admin(&user)?;

    let expire_timestamp = if input.expire_timestamp == 0 {
        now_ts() + NEW_USER_DEFAULT_TTL_SECS
    } else {
        input.expire_timestamp
    };
    let new_user = User {
        token: generate_user_token(NEW_USER_TOKEN_LEN),
        nickname: input.nickname,
        avatar: input.avatar,
        admin: input.admin,
        expire_timestamp,
        cost: Cost::default(),
        setting: Some(input.setting.unwrap_or_default()),
    };
    state.users.put(new_user.clone()).await?;
    tracing::info!(created_by = %user.token, token = %new_user.token, "user created");
    Ok(Json(new_user))
}

#[derive(Debug, Deserialize)]
pub struct EditUserInput {
    pub token: String,
    #[serde(flatten)]
    pub edit: ProfileEdit,
}

pub async fn edit_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<EditUserInput>,
) -> AppResult<Json<User>> {
    let user = caller(&state, &headers).await?;
    require_admin(&user)?;

    let edited = state
        .users
        .update_profile(&input.token, input.edit)
        .await?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", "user not found"))?;
    tracing::info!(edited_by = %user.token, token = %edited.token, "user edited");
    Ok(Json(edited))
}

pub async fn get_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<GptSetting>> {
    let user = caller(&state, &headers).await?;
    require_admin(&user)?;
    Ok(Json(state.settings.snapshot().await))
}

pub async fn update_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(setting): Json<GptSetting>,
) -> AppResult<Json<GptSetting>> {
    let user = caller(&state, &headers).await?;
    require_admin(&user)?;
    let updated = state.settings.update(setting).await.map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "persistence_error",
            err.to_string(),
        )
    })?;
    tracing::info!(updated_by = %user.token, model = %updated.model, "global setting updated");
    Ok(Json(updated))
}

async fn caller(state: &AppState, headers: &HeaderMap) -> AppResult<User> {
    let user = authenticate(state.users.as_ref(), access_token(headers), now_ts()).await?;
    Ok(user)
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
