use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::sse::{SseDecoder, SseFrame};
use super::{ConversationBackend, EventStream};
use crate::config::Secrets;
use crate::error::BackendError;
use crate::events::{
    BackendMessage, Role, RunError, RunOptions, RunRef, RunSnapshot, RunStatus, SessionHandle,
    StreamEvent,
};

/// Client for the hosted assistants API (threads, messages and runs).
pub struct AssistantsBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    vector_store_id: Option<String>,
    /// Event streams of runs created with `stream = true`, keyed by run id
    pending_streams: Mutex<HashMap<String, PendingStream>>,
}

/// Remainder of a streaming run response after its `thread.run.created` event
struct PendingStream {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    backlog: VecDeque<StreamEvent>,
}

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    id: String,
    role: Role,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<TextPart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    thread_id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    #[serde(default)]
    id: Option<String>,
    delta: MessageDelta,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    content: Vec<DeltaPart>,
}

#[derive(Debug, Deserialize)]
struct DeltaPart {
    #[serde(default)]
    text: Option<DeltaText>,
}

#[derive(Debug, Deserialize)]
struct DeltaText {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<RunError>,
}

impl From<RunObject> for RunSnapshot {
    fn from(run: RunObject) -> Self {
        RunSnapshot {
            run_id: run.id,
            status: run.status,
            last_error: run.last_error,
        }
    }
}

impl From<MessageObject> for BackendMessage {
    fn from(message: MessageObject) -> Self {
        let text = message
            .content
            .into_iter()
            .filter_map(|part| part.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        BackendMessage {
            id: message.id,
            role: message.role,
            run_id: message.run_id,
            text,
        }
    }
}

impl AssistantsBackend {
    pub fn new(
        base_url: impl Into<String>,
        secrets: &Secrets,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: secrets.api_key.clone(),
            vector_store_id: secrets.vector_store_id.clone(),
            pending_streams: Mutex::new(HashMap::new()),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send_json<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = check_status(request.send().await?).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn store_stream(&self, run_id: &str, pending: PendingStream) -> Result<(), BackendError> {
        let mut streams = self
            .pending_streams
            .lock()
            .map_err(|_| BackendError::Protocol("pending stream table poisoned".into()))?;
        streams.insert(run_id.to_string(), pending);
        Ok(())
    }

    fn take_stream(&self, run_id: &str) -> Result<Option<PendingStream>, BackendError> {
        let mut streams = self
            .pending_streams
            .lock()
            .map_err(|_| BackendError::Protocol("pending stream table poisoned".into()))?;
        Ok(streams.remove(run_id))
    }

    /// Create a streaming run and read just far enough to learn its id
    async fn create_streaming_run(
        &self,
        session: &SessionHandle,
        options: &RunOptions,
    ) -> Result<RunRef, BackendError> {
        let response = self
            .request(Method::POST, &format!("/threads/{}/runs", session))
            .header("Accept", "text/event-stream")
            .json(options)
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut pending = PendingStream {
            bytes: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            decoder: SseDecoder::new(),
            backlog: VecDeque::new(),
        };

        loop {
            let Some(chunk) = pending.bytes.next().await else {
                return Err(BackendError::Protocol(
                    "run stream ended before the run was created".into(),
                ));
            };
            for frame in pending.decoder.push(&chunk?) {
                if let Some(event) = parse_event(&frame)? {
                    pending.backlog.push_back(event);
                }
            }

            let created = pending.backlog.iter().find_map(|event| match event {
                StreamEvent::RunCreated { run_id } => Some(run_id.clone()),
                _ => None,
            });
            if let Some(run_id) = created {
                pending
                    .backlog
                    .retain(|event| !matches!(event, StreamEvent::RunCreated { .. }));
                info!(thread_id = %session, run_id = %run_id, "created streaming run");
                self.store_stream(&run_id, pending)?;
                return Ok(RunRef {
                    session: session.clone(),
                    run_id,
                });
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    warn!(status, "assistants API returned an error");
    Err(BackendError::Status { status, body })
}

/// Map one SSE frame of a run stream to a [`StreamEvent`]; unknown events are skipped
fn parse_event(frame: &SseFrame) -> Result<Option<StreamEvent>, BackendError> {
    let Some(event) = frame.event.as_deref() else {
        return Ok(None);
    };

    let parsed = match event {
        "thread.run.created" => {
            let run: RunObject = serde_json::from_str(&frame.data)?;
            Some(StreamEvent::RunCreated { run_id: run.id })
        }
        "thread.message.delta" => {
            let delta: MessageDeltaEvent = serde_json::from_str(&frame.data)?;
            let text: String = delta
                .delta
                .content
                .into_iter()
                .filter_map(|part| part.text.and_then(|t| t.value))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(StreamEvent::TextDelta {
                    message_id: delta.id,
                    text,
                })
            }
        }
        "error" => {
            let message = serde_json::from_str::<ErrorEvent>(&frame.data)
                .ok()
                .and_then(|e| e.message.or_else(|| e.error.map(|err| err.message)))
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| frame.data.clone());
            Some(StreamEvent::Error(message))
        }
        "done" => Some(StreamEvent::Done),
        run_event if run_event.starts_with("thread.run.") && !run_event.starts_with("thread.run.step") => {
            let run: RunObject = serde_json::from_str(&frame.data)?;
            Some(StreamEvent::Status(run.into()))
        }
        other => {
            debug!(event = other, "ignoring stream event");
            None
        }
    };
    Ok(parsed)
}

fn into_event_stream(pending: PendingStream) -> EventStream {
    futures::stream::unfold(Some(pending), |state| async move {
        let mut pending = state?;
        loop {
            if let Some(event) = pending.backlog.pop_front() {
                return Some((Ok(event), Some(pending)));
            }

            match pending.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in pending.decoder.push(&chunk) {
                        match parse_event(&frame) {
                            Ok(Some(event)) => pending.backlog.push_back(event),
                            Ok(None) => {}
                            Err(e) => return Some((Err(e), None)),
                        }
                    }
                }
                Some(Err(e)) => return Some((Err(e.into()), None)),
                None => {
                    let last = pending.decoder.finish();
                    return match last.as_ref().map(parse_event) {
                        Some(Ok(Some(event))) => Some((Ok(event), None)),
                        Some(Err(e)) => Some((Err(e), None)),
                        _ => None,
                    };
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ConversationBackend for AssistantsBackend {
    async fn create_session(&self) -> Result<SessionHandle, BackendError> {
        let body = match &self.vector_store_id {
            Some(id) => serde_json::json!({
                "tool_resources": { "file_search": { "vector_store_ids": [id] } }
            }),
            None => serde_json::json!({}),
        };
        let thread: ThreadObject =
            Self::send_json(self.request(Method::POST, "/threads").json(&body)).await?;
        Ok(SessionHandle::new(thread.id))
    }

    async fn post_message(
        &self,
        session: &SessionHandle,
        role: Role,
        text: &str,
    ) -> Result<String, BackendError> {
        let body = serde_json::json!({ "role": role, "content": text });
        let message: MessageObject = Self::send_json(
            self.request(Method::POST, &format!("/threads/{}/messages", session))
                .json(&body),
        )
        .await?;
        Ok(message.id)
    }

    async fn create_run(
        &self,
        session: &SessionHandle,
        options: &RunOptions,
    ) -> Result<RunRef, BackendError> {
        if options.stream {
            return self.create_streaming_run(session, options).await;
        }

        let run: RunObject = Self::send_json(
            self.request(Method::POST, &format!("/threads/{}/runs", session))
                .json(options),
        )
        .await?;
        Ok(RunRef {
            session: SessionHandle::new(run.thread_id),
            run_id: run.id,
        })
    }

    async fn get_run_status(&self, run: &RunRef) -> Result<RunSnapshot, BackendError> {
        let run: RunObject = Self::send_json(self.request(
            Method::GET,
            &format!("/threads/{}/runs/{}", run.session, run.run_id),
        ))
        .await?;
        Ok(run.into())
    }

    async fn list_messages(
        &self,
        session: &SessionHandle,
    ) -> Result<Vec<BackendMessage>, BackendError> {
        let list: ListResponse<MessageObject> = Self::send_json(
            self.request(Method::GET, &format!("/threads/{}/messages", session))
                .query(&[("order", "desc")]),
        )
        .await?;
        Ok(list.data.into_iter().map(BackendMessage::from).collect())
    }

    async fn stream_run(&self, run: &RunRef) -> Result<EventStream, BackendError> {
        let pending = self.take_stream(&run.run_id)?.ok_or_else(|| {
            BackendError::Protocol(format!("no open stream for run {}", run.run_id))
        })?;
        Ok(into_event_stream(pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn parses_message_delta() {
        let event = parse_event(&frame(
            "thread.message.delta",
            r#"{"id":"msg_1","object":"thread.message.delta","delta":{"content":[{"index":0,"type":"text","text":{"value":"Hel"}}]}}"#,
        ))
        .unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::TextDelta {
                message_id: Some("msg_1".into()),
                text: "Hel".into(),
            })
        );
    }

    #[test]
    fn parses_failed_run() {
        let event = parse_event(&frame(
            "thread.run.failed",
            r#"{"id":"run_1","thread_id":"thread_1","status":"failed","last_error":{"code":"server_error","message":"boom"}}"#,
        ))
        .unwrap();
        let Some(StreamEvent::Status(snapshot)) = event else {
            panic!("expected a status event, got {event:?}");
        };
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.failure_reason(), "boom");
    }

    #[test]
    fn skips_step_events_and_unknown_events() {
        assert_eq!(
            parse_event(&frame("thread.run.step.created", "{}")).unwrap(),
            None
        );
        assert_eq!(parse_event(&frame("thread.message.created", "{}")).unwrap(), None);
    }

    #[test]
    fn error_event_message() {
        let event = parse_event(&frame("error", r#"{"message":"quota exceeded"}"#)).unwrap();
        assert_eq!(event, Some(StreamEvent::Error("quota exceeded".into())));
    }

    #[test]
    fn message_text_parts_are_joined() {
        let message: MessageObject = serde_json::from_str(
            r#"{"id":"msg_1","role":"assistant","run_id":"run_1","content":[
                {"type":"text","text":{"value":"first","annotations":[]}},
                {"type":"image_file","image_file":{"file_id":"f"}},
                {"type":"text","text":{"value":"second","annotations":[]}}
            ]}"#,
        )
        .unwrap();
        let message = BackendMessage::from(message);
        assert_eq!(message.text, "first\nsecond");
        assert_eq!(message.run_id.as_deref(), Some("run_1"));
    }
}
