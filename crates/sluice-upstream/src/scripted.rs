// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pre-scripted transport for tests.
//!
//! Each `chat_stream` / `image_ws` call pops the next script from a queue,
//! so tests specify exact event sequences — including connect-level status
//! failures and streams that go silent — without network access.  Calls
//! are recorded so tests can assert which token was used for which
//! attempt.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use crate::{
    ChatPayload, EventStream, FrameStream, ImagePayload, Transport, UpstreamError, UpstreamEvent,
    WsFrame,
};

/// Script for one `chat_stream` call.
pub struct ChatScript {
    pub events: Vec<Result<UpstreamEvent, UpstreamError>>,
    /// After the scripted events, never yield again (instead of ending the
    /// stream).  Exercises idle-timeout handling.
    pub then_hang: bool,
}

/// Script for one `image_ws` call.
pub struct WsScript {
    pub frames: Vec<Result<WsFrame, UpstreamError>>,
    pub then_hang: bool,
}

#[derive(Default)]
pub struct ScriptedTransport {
    chat_scripts: Mutex<VecDeque<Result<ChatScript, UpstreamError>>>,
    ws_scripts: Mutex<VecDeque<Result<WsScript, UpstreamError>>>,
    /// `(token, payload)` per chat call, in order.
    chat_calls: Mutex<Vec<(String, ChatPayload)>>,
    /// `(token, payload)` per WebSocket call, in order.
    ws_calls: Mutex<Vec<(String, ImagePayload)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful chat stream emitting `events` then ending.
    pub fn queue_chat_events(&self, events: Vec<UpstreamEvent>) {
        self.chat_scripts.lock().unwrap().push_back(Ok(ChatScript {
            events: events.into_iter().map(Ok).collect(),
            then_hang: false,
        }));
    }

    /// Queue a chat stream that emits `events` and then goes silent.
    pub fn queue_chat_then_hang(&self, events: Vec<UpstreamEvent>) {
        self.chat_scripts.lock().unwrap().push_back(Ok(ChatScript {
            events: events.into_iter().map(Ok).collect(),
            then_hang: true,
        }));
    }

    /// Queue a connect-level HTTP failure.
    pub fn queue_chat_status(&self, status: u16, retry_after: Option<u64>) {
        self.chat_scripts
            .lock()
            .unwrap()
            .push_back(Err(UpstreamError::Status {
                status,
                retry_after,
            }));
    }

    /// Queue a chat script with full control over per-event results.
    pub fn queue_chat_script(&self, script: ChatScript) {
        self.chat_scripts.lock().unwrap().push_back(Ok(script));
    }

    /// Queue a successful WebSocket session.
    pub fn queue_ws(&self, script: WsScript) {
        self.ws_scripts.lock().unwrap().push_back(Ok(script));
    }

    pub fn queue_ws_status(&self, status: u16) {
        self.ws_scripts
            .lock()
            .unwrap()
            .push_back(Err(UpstreamError::Status {
                status,
                retry_after: None,
            }));
    }

    /// Tokens used by chat calls, in call order.
    pub fn chat_tokens(&self) -> Vec<String> {
        self.chat_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Payloads sent by chat calls, in call order.
    pub fn chat_payloads(&self) -> Vec<ChatPayload> {
        self.chat_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn ws_call_count(&self) -> usize {
        self.ws_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn chat_stream(
        &self,
        token: &str,
        payload: ChatPayload,
    ) -> Result<EventStream, UpstreamError> {
        self.chat_calls
            .lock()
            .unwrap()
            .push((token.to_string(), payload));
        let script = self
            .chat_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(UpstreamError::Protocol("no scripted response".into())))?;

        let head = stream::iter(script.events);
        if script.then_hang {
            Ok(Box::pin(head.chain(stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }

    async fn image_ws(
        &self,
        token: &str,
        payload: ImagePayload,
    ) -> Result<FrameStream, UpstreamError> {
        self.ws_calls
            .lock()
            .unwrap()
            .push((token.to_string(), payload));
        let script = self
            .ws_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(UpstreamError::Protocol("no scripted session".into())))?;

        let head = stream::iter(script.frames);
        if script.then_hang {
            Ok(Box::pin(head.chain(stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::DoneReason;

    #[tokio::test]
    async fn scripts_pop_in_order() {
        let transport = ScriptedTransport::new();
        transport.queue_chat_events(vec![UpstreamEvent::Delta { text: "one".into() }]);
        transport.queue_chat_status(429, Some(30));

        let mut first = transport
            .chat_stream("tok-a", ChatPayload::text("grok-4", "hi", false))
            .await
            .unwrap();
        assert!(matches!(
            first.next().await,
            Some(Ok(UpstreamEvent::Delta { .. }))
        ));

        let err = transport
            .chat_stream("tok-b", ChatPayload::text("grok-4", "hi", false))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            UpstreamError::Status {
                status: 429,
                retry_after: Some(30)
            }
        ));

        assert_eq!(transport.chat_tokens(), vec!["tok-a", "tok-b"]);
    }

    #[tokio::test]
    async fn exhausted_scripts_error_loudly() {
        let transport = ScriptedTransport::new();
        let err = transport
            .chat_stream("tok", ChatPayload::text("grok-4", "hi", false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UpstreamError::Protocol(_)));
    }

    #[tokio::test]
    async fn hang_script_pends_after_events() {
        let transport = ScriptedTransport::new();
        transport.queue_chat_then_hang(vec![UpstreamEvent::Done {
            reason: DoneReason::Stop,
        }]);
        let mut stream = transport
            .chat_stream("tok", ChatPayload::text("grok-4", "hi", false))
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        let next = tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err(), "stream must hang, not end");
    }
}
