// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-request orchestration: token acquisition, upstream connection,
//! translation, outcome reporting.
//!
//! # State machine
//!
//! ```text
//! Acquiring ──► Connecting ──► Streaming ──► Completed
//!     ▲             │              │
//!     └── retryable ┘              └──► Failed (terminal once bytes flowed)
//! ```
//!
//! A connect-level failure with a retryable status re-enters `Acquiring`
//! with a **different** token (the pipeline never reuses a token within
//! one client request).  Once the upstream stream is established, any
//! failure is terminal for the client — partial responses are never
//! re-streamed.
//!
//! Each `run_*` call returns immediately with a chunk stream; the work
//! happens in a spawned task that feeds a bounded channel.  Dropping the
//! stream cancels the request: the task notices the closed channel at its
//! next suspension point and drops the upstream connection.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use sluice_config::Config;
use sluice_pool::{mask_token, ClassHint, Outcome, PoolError, TokenLease, TokenPool};
use sluice_translate::{
    collect_final_image, ChatOptions, ChatTranslator, MediaChunk, MediaDatum, MediaSink,
    OpenAiChunk, TranslateError,
};
use sluice_upstream::{
    AssetKind, ChatPayload, EventStream, ImagePayload, Transport, UpstreamError, VideoParams,
};

use crate::{class_hint, wants_reasoning, GatewayError, RequestKind, VideoShape};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<OpenAiChunk, GatewayError>> + Send>>;

/// Chat request after HTTP-level validation and prompt flattening.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub model: String,
    pub prompt: String,
    pub reasoning_effort: Option<String>,
}

/// Image generation/edit request.
#[derive(Debug, Clone)]
pub struct ImageCall {
    pub model: String,
    pub prompt: String,
    pub n: u32,
    pub b64_json: bool,
    pub source_image: Option<Vec<u8>>,
}

/// Video generation request.
#[derive(Debug, Clone)]
pub struct VideoCall {
    pub model: String,
    pub prompt: String,
    pub resolution_name: String,
    pub video_length: u32,
}

#[derive(Clone)]
pub struct Pipeline {
    pool: TokenPool,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaSink>,
    config: Arc<Config>,
}

/// Everything `run_conversation` needs, fixed at request start.
struct ConversationSpec {
    kind: RequestKind,
    hint: ClassHint,
    payload: ChatPayload,
    client_model: String,
    show_reasoning: bool,
    b64_media: bool,
    idle: Duration,
}

/// Mutable retry bookkeeping across connect attempts.
struct RetryState {
    used: HashSet<String>,
    /// Token that got a 401 on the immediately preceding attempt.
    prev_401: Option<TokenLease>,
    backoff_spent: Duration,
}

impl RetryState {
    fn new() -> Self {
        Self {
            used: HashSet::new(),
            prev_401: None,
            backoff_spent: Duration::ZERO,
        }
    }
}

impl Pipeline {
    pub fn new(
        pool: TokenPool,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaSink>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            pool,
            transport,
            media,
            config,
        }
    }

    // ── Public entry points ───────────────────────────────────────────────────

    pub fn run_chat(&self, call: ChatCall) -> ChunkStream {
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();
        tokio::spawn(async move {
            let show_reasoning =
                wants_reasoning(&call.model, call.reasoning_effort.as_deref())
                    && this.config.stream.show_thinking;
            let spec = ConversationSpec {
                kind: RequestKind::Chat,
                hint: class_hint(&call.model, None),
                payload: ChatPayload::text(
                    upstream_model(&call.model),
                    call.prompt,
                    show_reasoning,
                ),
                client_model: call.model,
                show_reasoning,
                b64_media: false,
                idle: Duration::from_secs(this.config.stream.idle_timeout_secs),
            };
            this.run_conversation(spec, tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    pub fn run_video(&self, call: VideoCall) -> ChunkStream {
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();
        tokio::spawn(async move {
            let shape = VideoShape {
                resolution_name: call.resolution_name.clone(),
                video_length: call.video_length,
            };
            let spec = ConversationSpec {
                kind: RequestKind::Video,
                hint: class_hint(&call.model, Some(&shape)),
                payload: ChatPayload {
                    model_name: upstream_model(&call.model),
                    message: call.prompt,
                    enable_thinking: false,
                    video: Some(VideoParams {
                        resolution_name: call.resolution_name,
                        video_length: call.video_length,
                    }),
                    image_count: None,
                    source_image: None,
                },
                client_model: call.model,
                show_reasoning: false,
                b64_media: false,
                idle: Duration::from_secs(this.config.stream.video_idle_timeout_secs),
            };
            this.run_conversation(spec, tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    pub fn run_image(&self, call: ImageCall) -> ChunkStream {
        let (tx, rx) = mpsc::channel(8);
        let this = self.clone();
        tokio::spawn(async move {
            if this.config.upstream.image_over_ws {
                this.run_image_ws(call, tx).await;
            } else {
                let spec = ConversationSpec {
                    kind: RequestKind::Image,
                    hint: class_hint(&call.model, None),
                    payload: ChatPayload {
                        model_name: upstream_model(&call.model),
                        message: call.prompt,
                        enable_thinking: false,
                        video: None,
                        image_count: Some(call.n.max(1)),
                        source_image: call.source_image.map(|b| B64.encode(b)),
                    },
                    client_model: call.model,
                    show_reasoning: false,
                    b64_media: call.b64_json,
                    idle: Duration::from_secs(this.config.stream.image_idle_timeout_secs),
                };
                this.run_conversation(spec, tx).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    // ── NDJSON conversation path (chat / video / image-over-http) ─────────────

    async fn run_conversation(
        &self,
        spec: ConversationSpec,
        tx: mpsc::Sender<Result<OpenAiChunk, GatewayError>>,
    ) {
        let max_attempts = self.config.retry.max_retry.max(1);
        let mut state = RetryState::new();
        let opts = ChatOptions {
            request_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model: spec.client_model.clone(),
            created: Utc::now().timestamp(),
            show_reasoning: spec.show_reasoning,
            filtered_tags: self.config.stream.filtered_tags.clone(),
            b64_media: spec.b64_media,
        };

        for attempt in 1..=max_attempts {
            let lease = match self
                .pool
                .acquire_excluding(spec.hint, spec.kind.as_str(), &state.used)
                .await
            {
                Ok(lease) => lease,
                Err(PoolError::NoToken { .. }) => {
                    send_err(&tx, GatewayError::PoolEmpty).await;
                    return;
                }
                Err(e) => {
                    send_err(&tx, GatewayError::Internal(e.to_string())).await;
                    return;
                }
            };
            state.used.insert(lease.token_id.clone());
            debug!(
                token = %mask_token(&lease.token_id),
                attempt,
                kind = spec.kind.as_str(),
                "connecting upstream"
            );

            let events = match self
                .transport
                .chat_stream(&lease.token_id, spec.payload.clone())
                .await
            {
                Ok(events) => events,
                Err(err) => {
                    if self
                        .on_connect_failure(&mut state, lease, err, attempt, max_attempts, &tx)
                        .await
                    {
                        continue;
                    }
                    return;
                }
            };

            self.stream_events(events, lease, opts, spec.idle, &tx).await;
            return;
        }

        send_err(&tx, GatewayError::UpstreamTimeout).await;
    }

    /// Handle a connect-level failure.  Returns `true` when the caller
    /// should retry with a fresh token (backoff already applied); on
    /// `false` the terminal error has been sent.
    async fn on_connect_failure(
        &self,
        state: &mut RetryState,
        lease: TokenLease,
        err: UpstreamError,
        attempt: u32,
        max_attempts: u32,
        tx: &mpsc::Sender<Result<OpenAiChunk, GatewayError>>,
    ) -> bool {
        let retry = &self.config.retry;
        let (status, retry_after) = match err {
            UpstreamError::Status {
                status,
                retry_after,
            } => (status, retry_after),
            other => {
                self.pool
                    .release(&lease, Outcome::TransientFailure { status: None })
                    .await;
                send_err(&tx, GatewayError::UpstreamUnreachable(other.to_string())).await;
                return false;
            }
        };

        match status {
            // Quota exhaustion cools the token without penalising it.
            429 => {
                let secs = retry_after.unwrap_or(60);
                self.pool
                    .release(
                        &lease,
                        Outcome::QuotaExhausted {
                            reset_at: Utc::now() + ChronoDuration::seconds(secs as i64),
                        },
                    )
                    .await;
                state.prev_401 = None;
            }
            401 => {
                if let Some(prev) = state.prev_401.take() {
                    // Two distinct tokens rejected back to back: not a
                    // token-local problem.  Disable both and give up.
                    let reason = "401 on consecutive tokens".to_string();
                    self.pool
                        .release(
                            &prev,
                            Outcome::TerminalFailure {
                                reason: reason.clone(),
                            },
                        )
                        .await;
                    self.pool
                        .release(&lease, Outcome::TerminalFailure { reason })
                        .await;
                    send_err(&tx, GatewayError::AuthRevoked).await;
                    return false;
                }
                self.pool
                    .release(
                        &lease,
                        Outcome::TransientFailure {
                            status: Some(status),
                        },
                    )
                    .await;
                state.prev_401 = Some(lease);
            }
            _ => {
                self.pool
                    .release(
                        &lease,
                        Outcome::TransientFailure {
                            status: Some(status),
                        },
                    )
                    .await;
                state.prev_401 = None;
            }
        }

        if !retry.status_codes.contains(&status) || attempt >= max_attempts {
            send_err(&tx, GatewayError::UpstreamHttp { status }).await;
            return false;
        }

        let delay = backoff_delay(retry, attempt);
        if state.backoff_spent + delay > Duration::from_secs(retry.budget_secs) {
            send_err(&tx, GatewayError::UpstreamTimeout).await;
            return false;
        }
        state.backoff_spent += delay;
        tokio::time::sleep(delay).await;
        true
    }

    /// Streaming phase.  Whatever happens here is terminal for the client.
    async fn stream_events(
        &self,
        mut events: EventStream,
        lease: TokenLease,
        opts: ChatOptions,
        idle: Duration,
        tx: &mpsc::Sender<Result<OpenAiChunk, GatewayError>>,
    ) {
        let mut translator = ChatTranslator::new(opts, self.media.as_ref(), lease.token_id.as_str());
        let outcome;

        loop {
            let next = tokio::select! {
                // Client went away: close the upstream promptly, discard
                // whatever is in flight.
                _ = tx.closed() => {
                    debug!(token = %mask_token(&lease.token_id), "client disconnected");
                    outcome = cancel_outcome(&translator);
                    break;
                }
                item = tokio::time::timeout(idle, events.next()) => item,
            };

            match next {
                Err(_) => {
                    warn!(token = %mask_token(&lease.token_id), "stream idle timeout");
                    outcome = Outcome::TransientFailure { status: None };
                    let _ = tx.send(Err(GatewayError::UpstreamTimeout)).await;
                    break;
                }
                Ok(None) => {
                    // Upstream ended without an explicit Done; tolerated.
                    for chunk in translator.finish() {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    outcome = if translator.saw_output() {
                        Outcome::Success { quota_hint: None }
                    } else {
                        Outcome::TransientFailure { status: None }
                    };
                    break;
                }
                Ok(Some(item)) => match translator.on_event(item).await {
                    Ok(chunks) => {
                        let mut client_gone = false;
                        for chunk in chunks {
                            if tx.send(Ok(chunk)).await.is_err() {
                                client_gone = true;
                                break;
                            }
                        }
                        if client_gone {
                            outcome = cancel_outcome(&translator);
                            break;
                        }
                        if translator.is_finished() {
                            outcome = Outcome::Success { quota_hint: None };
                            break;
                        }
                    }
                    Err(err) => {
                        let (gateway_err, failure_outcome) = map_stream_failure(err);
                        warn!(
                            token = %mask_token(&lease.token_id),
                            kind = gateway_err.kind(),
                            "stream failed: {gateway_err}"
                        );
                        outcome = failure_outcome;
                        let _ = tx.send(Err(gateway_err)).await;
                        break;
                    }
                },
            }
        }

        drop(events);
        self.pool.release(&lease, outcome).await;
    }

    // ── WebSocket image path ──────────────────────────────────────────────────

    async fn run_image_ws(
        &self,
        call: ImageCall,
        tx: mpsc::Sender<Result<OpenAiChunk, GatewayError>>,
    ) {
        let max_attempts = self.config.retry.max_retry.max(1);
        let mut state = RetryState::new();
        let created = Utc::now().timestamp();
        let idle = Duration::from_secs(self.config.stream.image_idle_timeout_secs);
        let final_timeout = Duration::from_secs(self.config.image_ws.final_timeout_secs);
        let payload = ImagePayload {
            model_name: upstream_model(&call.model),
            prompt: call.prompt.clone(),
            count: call.n.max(1),
            source_image: call.source_image.as_ref().map(|b| B64.encode(b)),
        };

        for attempt in 1..=max_attempts {
            let lease = match self
                .pool
                .acquire_excluding(class_hint(&call.model, None), "image", &state.used)
                .await
            {
                Ok(lease) => lease,
                Err(PoolError::NoToken { .. }) => {
                    send_err(&tx, GatewayError::PoolEmpty).await;
                    return;
                }
                Err(e) => {
                    send_err(&tx, GatewayError::Internal(e.to_string())).await;
                    return;
                }
            };
            state.used.insert(lease.token_id.clone());

            let first = match self.transport.image_ws(&lease.token_id, payload.clone()).await {
                Ok(frames) => frames,
                Err(err) => {
                    if self
                        .on_connect_failure(&mut state, lease, err, attempt, max_attempts, &tx)
                        .await
                    {
                        continue;
                    }
                    return;
                }
            };

            // One session per requested image; the first one is open
            // already.  A failure after this point is terminal.
            let mut open_session = Some(first);
            for _ in 0..call.n.max(1) {
                let frames = match open_session.take() {
                    Some(frames) => frames,
                    None => match self.transport.image_ws(&lease.token_id, payload.clone()).await
                    {
                        Ok(frames) => frames,
                        Err(err) => {
                            self.pool
                                .release(&lease, Outcome::TransientFailure { status: err.status() })
                                .await;
                            send_err(&tx, GatewayError::UpstreamUnreachable(err.to_string()))
                                .await;
                            return;
                        }
                    },
                };

                let bytes =
                    match collect_final_image(frames, &self.config.image_ws, idle, final_timeout)
                        .await
                    {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            let (gateway_err, outcome) = map_stream_failure(err);
                            self.pool.release(&lease, outcome).await;
                            let _ = tx.send(Err(gateway_err)).await;
                            return;
                        }
                    };

                let stored = match self.media.put(bytes, AssetKind::Image).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        self.pool
                            .release(&lease, Outcome::Success { quota_hint: None })
                            .await;
                        send_err(&tx, GatewayError::Internal(e.to_string())).await;
                        return;
                    }
                };
                let datum = if call.b64_json {
                    MediaDatum {
                        url: None,
                        b64_json: Some(B64.encode(&stored.bytes)),
                    }
                } else {
                    MediaDatum {
                        url: Some(stored.url),
                        b64_json: None,
                    }
                };
                if tx
                    .send(Ok(OpenAiChunk::Media(MediaChunk {
                        created,
                        data: vec![datum],
                    })))
                    .await
                    .is_err()
                {
                    // Client gone; the image is cached either way.
                    self.pool
                        .release(&lease, Outcome::Success { quota_hint: None })
                        .await;
                    return;
                }
            }

            self.pool
                .release(&lease, Outcome::Success { quota_hint: None })
                .await;
            return;
        }

        send_err(&tx, GatewayError::UpstreamTimeout).await;
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Upstream model id for a client-facing model id.  Thinking variants are
/// routed as their base model with thinking enabled in the payload.
fn upstream_model(model: &str) -> String {
    model.strip_suffix("-thinking").unwrap_or(model).to_string()
}

fn backoff_delay(retry: &sluice_config::RetryConfig, attempt: u32) -> Duration {
    let factor = retry.backoff_factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
    let ms = (retry.backoff_base_ms as f64 * factor) as u64;
    Duration::from_millis(ms.min(retry.backoff_max_ms))
}

fn cancel_outcome(translator: &ChatTranslator<'_>) -> Outcome {
    if translator.saw_output() {
        Outcome::Success { quota_hint: None }
    } else {
        Outcome::Cancelled
    }
}

async fn send_err(tx: &mpsc::Sender<Result<OpenAiChunk, GatewayError>>, err: GatewayError) {
    warn!(kind = err.kind(), "request failed: {err}");
    let _ = tx.send(Err(err)).await;
}

fn map_stream_failure(err: TranslateError) -> (GatewayError, Outcome) {
    match err {
        TranslateError::IdleTimeout(_) => (
            GatewayError::UpstreamTimeout,
            Outcome::TransientFailure { status: None },
        ),
        // A content-policy block means the token itself works fine.
        TranslateError::Blocked => (
            GatewayError::TranslatorBlocked,
            Outcome::Success { quota_hint: None },
        ),
        TranslateError::Protocol(msg) => (
            GatewayError::TranslatorProtocol(msg),
            Outcome::TransientFailure { status: None },
        ),
        TranslateError::InBand {
            kind,
            message,
            http_status,
        } => match http_status {
            Some(401) => (
                GatewayError::AuthRevoked,
                Outcome::TerminalFailure {
                    reason: format!("{kind}: {message}"),
                },
            ),
            Some(429) => (
                GatewayError::QuotaExhausted { reset_at: None },
                Outcome::QuotaExhausted {
                    reset_at: Utc::now() + ChronoDuration::seconds(60),
                },
            ),
            Some(status) => (
                GatewayError::UpstreamHttp { status },
                Outcome::TransientFailure {
                    status: Some(status),
                },
            ),
            None => (
                GatewayError::TranslatorProtocol(format!("{kind}: {message}")),
                Outcome::TransientFailure { status: None },
            ),
        },
        TranslateError::Upstream(UpstreamError::Status { status, .. }) => (
            GatewayError::UpstreamHttp { status },
            Outcome::TransientFailure {
                status: Some(status),
            },
        ),
        TranslateError::Upstream(e) => (
            GatewayError::UpstreamUnreachable(e.to_string()),
            Outcome::TransientFailure { status: None },
        ),
        // Our disk failed, not the upstream.
        TranslateError::Media(msg) => (
            GatewayError::Internal(msg),
            Outcome::Success { quota_hint: None },
        ),
    }
}
