//! Relays provider completions to the caller and bills them.
//!
//! A request moves through `Assembling → AwaitingUpstream → Emitting* →
//! Finalizing → Closed`; any failure ends in `Aborted`. Exactly one terminal
//! frame is emitted per successful request and it is always the last one.

use crate::chat::{ChatInstance, ChatResponseFrame};
use crate::error::{AppError, ErrorEnvelope, RelayError};
use crate::tokenizer;
use crate::upstream::{ChatProvider, ChunkStream};
use crate::users::{Usage, UserRepository};
use axum::response::sse::Event;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Assembling,
    AwaitingUpstream,
    Emitting,
    Finalizing,
    Closed,
    Aborted,
}

fn transition(token: &str, from: RelayState, to: RelayState) -> RelayState {
    tracing::debug!(token = %token, ?from, ?to, "relay state");
    to
}

/// Item pushed to the caller's event stream.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Frame(ChatResponseFrame),
    Error(AppError),
}

impl RelayEvent {
    pub fn into_sse_event(self) -> Event {
        let data = match self {
            RelayEvent::Frame(frame) => serde_json::to_string(&frame),
            RelayEvent::Error(err) => serde_json::to_string(&ErrorEnvelope::from(&err)),
        };
        match data {
            Ok(data) => Event::default().data(data),
            Err(err) => {
                tracing::error!("frame encode failed: {err}");
                Event::default().data("{}")
            }
        }
    }
}

fn record_tokens(usage: &Usage, mode: &'static str) {
    metrics::counter!("gptrelay_prompt_tokens_total", "mode" => mode)
        .increment(usage.prompt_tokens.max(0) as u64);
    metrics::counter!("gptrelay_completion_tokens_total", "mode" => mode)
        .increment(usage.completion_tokens.max(0) as u64);
}

fn record_outcome(mode: &'static str, state: RelayState) {
    let outcome = if state == RelayState::Closed {
        "closed"
    } else {
        "aborted"
    };
    metrics::counter!("gptrelay_chat_requests_total", "mode" => mode, "outcome" => outcome)
        .increment(1);
}

/// Sends the request, waits for the whole completion and bills the
/// provider-reported usage.
pub async fn relay_sync(
    provider: &dyn ChatProvider,
    users: &dyn UserRepository,
    instance: ChatInstance,
) -> Result<ChatResponseFrame, RelayError> {
    let token = instance.user.token.as_str();
    let mut request = instance.request;
    request.stream = false;

    let state = transition(token, RelayState::Assembling, RelayState::AwaitingUpstream);
    let completion = match provider.complete(&instance.api_key, &request).await {
        Ok(completion) => completion,
        Err(err) => {
            tracing::error!(token = %token, model = %request.model, "chat completion failed: {}", err.message);
            record_outcome("sync", transition(token, state, RelayState::Aborted));
            return Err(err.into());
        }
    };

    let state = transition(token, state, RelayState::Finalizing);
    let cost = match users.update_usage(token, &completion.usage).await {
        Ok(cost) => cost,
        Err(err) => {
            record_outcome("sync", transition(token, state, RelayState::Aborted));
            return Err(err);
        }
    };
    record_tokens(&completion.usage, "sync");
    record_outcome("sync", transition(token, state, RelayState::Closed));

    Ok(ChatResponseFrame::terminal(
        completion.content,
        completion.created,
        completion.usage.total_tokens,
        cost,
    ))
}

/// An opened provider stream plus the locally estimated prompt size.
pub struct OpenedStream {
    pub instance: ChatInstance,
    pub prompt_tokens: i64,
    pub chunks: ChunkStream,
}

/// Estimates prompt tokens, since streamed responses carry no usage, then
/// opens the provider stream.
pub async fn open_stream(
    provider: &dyn ChatProvider,
    mut instance: ChatInstance,
) -> Result<OpenedStream, RelayError> {
    instance.request.stream = true;
    let prompt_tokens =
        tokenizer::count_message_tokens(&instance.request.messages, &instance.request.model);

    let token = instance.user.token.clone();
    let state = transition(&token, RelayState::Assembling, RelayState::AwaitingUpstream);
    match provider
        .complete_stream(&instance.api_key, &instance.request)
        .await
    {
        Ok(chunks) => Ok(OpenedStream {
            instance,
            prompt_tokens,
            chunks,
        }),
        Err(err) => {
            tracing::error!(token = %token, model = %instance.request.model, "chat stream open failed: {}", err.message);
            record_outcome("stream", transition(&token, state, RelayState::Aborted));
            Err(err.into())
        }
    }
}

/// Forwards every chunk as soon as it arrives, then bills and emits the
/// terminal frame once the provider ends the stream.
///
/// Stops without billing as soon as the caller has gone away. The provider
/// stream is dropped on every exit path.
pub async fn relay_stream(
    users: Arc<dyn UserRepository>,
    opened: OpenedStream,
    tx: mpsc::Sender<RelayEvent>,
) -> RelayState {
    let OpenedStream {
        instance,
        prompt_tokens,
        mut chunks,
    } = opened;
    let token = instance.user.token.as_str();
    let model = instance.request.model.as_str();

    let mut state = transition(token, RelayState::AwaitingUpstream, RelayState::Emitting);
    let mut response_text = String::new();
    loop {
        match chunks.next().await {
            Some(Ok(content)) => {
                if tx.is_closed() {
                    tracing::info!(token = %token, "caller disconnected, stopping relay");
                    state = transition(token, state, RelayState::Aborted);
                    break;
                }
                response_text.push_str(&content);
                if tx
                    .send(RelayEvent::Frame(ChatResponseFrame::chunk(content)))
                    .await
                    .is_err()
                {
                    tracing::info!(token = %token, "caller disconnected, stopping relay");
                    state = transition(token, state, RelayState::Aborted);
                    break;
                }
            }
            Some(Err(err)) => {
                tracing::error!(token = %token, "stream recv error: {}", err.message);
                let app_err: AppError = RelayError::from(err).into();
                let _ = tx.send(RelayEvent::Error(app_err)).await;
                state = transition(token, state, RelayState::Aborted);
                break;
            }
            None => {
                state = transition(token, state, RelayState::Finalizing);
                let completion_tokens = tokenizer::count_tokens(&response_text, model);
                let usage = Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                };
                tracing::debug!(token = %token, ?usage, chars = response_text.len(), "stream finished");
                match users.update_usage(token, &usage).await {
                    Ok(cost) => {
                        record_tokens(&usage, "stream");
                        // created is only reported for sync completions
                        let frame = ChatResponseFrame::terminal(
                            String::new(),
                            0,
                            usage.total_tokens,
                            cost,
                        );
                        let _ = tx.send(RelayEvent::Frame(frame)).await;
                        state = transition(token, state, RelayState::Closed);
                    }
                    Err(err) => {
                        tracing::error!(token = %token, ?usage, "update user cost failed: {err}");
                        let _ = tx.send(RelayEvent::Error(err.into())).await;
                        state = transition(token, state, RelayState::Aborted);
                    }
                }
                break;
            }
        }
    }
    drop(chunks);
    record_outcome("stream", state);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, ChatRequest};
    use crate::store::MemoryKvStore;
    use crate::upstream::{ChatCompletion, UpstreamCallError, UpstreamErrorKind};
    use crate::users::tests::{FailingKvStore, test_user};
    use crate::users::{DEFAULT_UNIT_PRICE, User, UserLedger, price_for};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_stream::wrappers::ReceiverStream;

    /// Provider replaying a fixed script.
    struct ScriptedProvider {
        completion: Result<ChatCompletion, UpstreamCallError>,
        chunks: Mutex<Option<ChunkStream>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn sync(completion: Result<ChatCompletion, UpstreamCallError>) -> Self {
            Self {
                completion,
                chunks: Mutex::new(None),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn streaming(chunks: ChunkStream) -> Self {
            Self {
                completion: Err(upstream_error("not scripted")),
                chunks: Mutex::new(Some(chunks)),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn complete(
            &self,
            _api_key: &str,
            request: &ChatRequest,
        ) -> Result<ChatCompletion, UpstreamCallError> {
            self.seen.lock().unwrap().push(request.clone());
            self.completion.clone()
        }

        async fn complete_stream(
            &self,
            _api_key: &str,
            request: &ChatRequest,
        ) -> Result<ChunkStream, UpstreamCallError> {
            self.seen.lock().unwrap().push(request.clone());
            self.chunks
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| upstream_error("stream already taken"))
        }
    }

    fn upstream_error(message: &str) -> UpstreamCallError {
        UpstreamCallError::new(UpstreamErrorKind::Network, None, message.to_string())
    }

    fn scripted(items: Vec<Result<&str, &str>>) -> ChunkStream {
        let items: Vec<Result<String, UpstreamCallError>> = items
            .into_iter()
            .map(|item| item.map(str::to_string).map_err(upstream_error))
            .collect();
        futures_util::stream::iter(items).boxed()
    }

    fn instance(user: User) -> ChatInstance {
        ChatInstance {
            user,
            api_key: "sk-test".to_string(),
            request: ChatRequest {
                model: "gpt-3.5-turbo".to_string(),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: "tell me a story".to_string(),
                    name: None,
                }],
                stream: false,
            },
        }
    }

    async fn ledger() -> Arc<UserLedger> {
        let ledger = UserLedger::new(Arc::new(MemoryKvStore::new()), DEFAULT_UNIT_PRICE);
        ledger.put(test_user("abc")).await.unwrap();
        Arc::new(ledger)
    }

    async fn drain(mut rx: mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn sync_bills_provider_reported_usage() {
        let users = ledger().await;
        let provider = ScriptedProvider::sync(Ok(ChatCompletion {
            created: 1_700_000_000,
            content: "once upon a time".to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        }));
        let user = users.get("abc").await.unwrap();

        let frame = relay_sync(&provider, users.as_ref(), instance(user))
            .await
            .unwrap();

        assert!(frame.done);
        assert_eq!(frame.content, "once upon a time");
        assert_eq!(frame.created, 1_700_000_000);
        assert_eq!(frame.total_tokens, 15);
        let cost = frame.user_cost.unwrap();
        assert_eq!(cost.usage.total_tokens, 15);
        assert_eq!(cost.cost, price_for(15, DEFAULT_UNIT_PRICE));
        assert!(!provider.seen.lock().unwrap()[0].stream);
    }

    #[tokio::test]
    async fn sync_upstream_failure_leaves_ledger_untouched() {
        let users = ledger().await;
        let provider = ScriptedProvider::sync(Err(upstream_error("boom")));
        let user = users.get("abc").await.unwrap();

        let err = relay_sync(&provider, users.as_ref(), instance(user))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Upstream(_)));
        assert_eq!(users.get("abc").await.unwrap().cost.usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn sync_persistence_failure_is_reported() {
        let ledger = UserLedger::new(Arc::new(FailingKvStore), DEFAULT_UNIT_PRICE);
        let _ = ledger.put(test_user("abc")).await;
        let provider = ScriptedProvider::sync(Ok(ChatCompletion {
            created: 0,
            content: "x".to_string(),
            usage: Usage {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
            },
        }));

        let err = relay_sync(&provider, &ledger, instance(test_user("abc")))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));
    }

    #[tokio::test]
    async fn stream_emits_chunks_in_order_then_one_terminal_frame() {
        let users = ledger().await;
        let provider = ScriptedProvider::streaming(scripted(vec![
            Ok("Once"),
            Ok(" upon"),
            Ok(" a time"),
        ]));
        let user = users.get("abc").await.unwrap();
        let opened = open_stream(&provider, instance(user)).await.unwrap();
        assert!(provider.seen.lock().unwrap()[0].stream);
        let prompt_tokens = opened.prompt_tokens;
        assert!(prompt_tokens > 0);

        let (tx, rx) = mpsc::channel(64);
        let state = relay_stream(users.clone(), opened, tx).await;
        assert_eq!(state, RelayState::Closed);

        let frames: Vec<ChatResponseFrame> = drain(rx)
            .await
            .into_iter()
            .map(|event| match event {
                RelayEvent::Frame(frame) => frame,
                RelayEvent::Error(err) => panic!("unexpected error frame: {}", err.message),
            })
            .collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames.iter().filter(|f| f.done).count(), 1);
        let terminal = frames.last().unwrap();
        assert!(terminal.done);
        assert!(terminal.content.is_empty());
        assert_eq!(terminal.created, 0);
        let encoded = serde_json::to_value(terminal).unwrap();
        assert!(encoded.get("created").is_none());

        let text: String = frames[..3].iter().map(|f| f.content.as_str()).collect();
        assert_eq!(text, "Once upon a time");
        let completion_tokens = tokenizer::count_tokens(&text, "gpt-3.5-turbo");
        assert_eq!(terminal.total_tokens, prompt_tokens + completion_tokens);

        let stored = users.get("abc").await.unwrap().cost;
        assert_eq!(stored.usage.prompt_tokens as i64, prompt_tokens);
        assert_eq!(stored.usage.completion_tokens as i64, completion_tokens);
        assert_eq!(terminal.user_cost, Some(stored));
    }

    #[tokio::test]
    async fn stream_persistence_failure_replaces_terminal_frame_with_error() {
        let users = UserLedger::new(Arc::new(FailingKvStore), DEFAULT_UNIT_PRICE);
        let _ = users.put(test_user("abc")).await;
        let users = Arc::new(users);
        let provider = ScriptedProvider::streaming(scripted(vec![Ok("a"), Ok("b")]));
        let opened = open_stream(&provider, instance(test_user("abc")))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(64);
        let state = relay_stream(users.clone(), opened, tx).await;
        assert_eq!(state, RelayState::Aborted);

        let events = drain(rx).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], RelayEvent::Frame(f) if !f.done && f.content == "a"));
        assert!(matches!(&events[1], RelayEvent::Frame(f) if !f.done && f.content == "b"));
        match &events[2] {
            RelayEvent::Error(err) => assert_eq!(err.code, "persistence_error"),
            other => panic!("unexpected event: {other:?}"),
        }

        let user = users.get("abc").await.unwrap();
        assert!(user.cost.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn stream_receive_error_aborts_without_terminal_or_billing() {
        let users = ledger().await;
        let provider =
            ScriptedProvider::streaming(scripted(vec![Ok("partial"), Err("connection reset")]));
        let user = users.get("abc").await.unwrap();
        let opened = open_stream(&provider, instance(user)).await.unwrap();

        let (tx, rx) = mpsc::channel(64);
        let state = relay_stream(users.clone(), opened, tx).await;
        assert_eq!(state, RelayState::Aborted);

        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RelayEvent::Frame(f) if !f.done && f.content == "partial"));
        assert!(matches!(&events[1], RelayEvent::Error(_)));
        assert_eq!(users.get("abc").await.unwrap().cost.usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn stream_stops_when_caller_disconnects() {
        let users = ledger().await;
        let (upstream_tx, upstream_rx) = mpsc::channel::<Result<String, UpstreamCallError>>(8);
        let provider = ScriptedProvider::streaming(ReceiverStream::new(upstream_rx).boxed());
        let user = users.get("abc").await.unwrap();
        let opened = open_stream(&provider, instance(user)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let relay = tokio::spawn(relay_stream(users.clone(), opened, tx));

        for chunk in ["one", "two"] {
            upstream_tx.send(Ok(chunk.to_string())).await.unwrap();
            match rx.recv().await {
                Some(RelayEvent::Frame(frame)) => assert_eq!(frame.content, chunk),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        drop(rx);
        upstream_tx.send(Ok("three".to_string())).await.unwrap();

        assert_eq!(relay.await.unwrap(), RelayState::Aborted);
        upstream_tx.closed().await;
        assert!(upstream_tx.send(Ok("four".to_string())).await.is_err());
        assert_eq!(users.get("abc").await.unwrap().cost.usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn stream_open_failure_is_an_upstream_error() {
        let provider = ScriptedProvider::sync(Err(upstream_error("unused")));
        *provider.chunks.lock().unwrap() = None;
        let err = open_stream(&provider, instance(test_user("abc")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Upstream(_)));
    }
}
