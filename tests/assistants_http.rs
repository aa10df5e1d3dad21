//! HTTP backend against a mock assistants API.


use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use monkchat::backend::{AssistantsBackend, ConversationBackend};
use monkchat::chat::{ChatSession, TurnOutcome};
use monkchat::config::{DriveStrategy, Persona, Secrets, default_personas};
use monkchat::driver::{DriverSettings, RunDriver};
use monkchat::error::{BackendError, ChatError};
use monkchat::events::{Chunk, Role, SessionHandle};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn secrets(vector_store_id: Option<&str>) -> Secrets {
    Secrets {
        api_key: "sk-test".into(),
        assistant_id: "asst_1".into(),
        vector_store_id: vector_store_id.map(str::to_string),
    }
}

fn backend(server: &MockServer, vector_store_id: Option<&str>) -> AssistantsBackend {
    AssistantsBackend::new(server.uri(), &secrets(vector_store_id), Duration::from_secs(5)).unwrap()
}

fn settings(strategy: DriveStrategy) -> DriverSettings {
    DriverSettings {
        strategy,
        poll_interval: Duration::from_millis(10),
        max_polls: 50,
        timeout: Duration::from_secs(5),
        typing_delay: Duration::ZERO,
    }
}

fn run_json(status: &str) -> serde_json::Value {
    json!({
        "id": "run_1",
        "object": "thread.run",
        "thread_id": "thread_1",
        "assistant_id": "asst_1",
        "status": status,
        "last_error": null
    })
}

async fn mount_thread_and_message(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/threads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "thread_1", "object": "thread"})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/messages"))
        .and(body_partial_json(json!({"role": "user"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_user",
            "object": "thread.message",
            "role": "user",
            "content": []
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn create_session_sends_vector_store_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/threads"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("OpenAI-Beta", "assistants=v2"))
        .and(body_json(json!({
            "tool_resources": { "file_search": { "vector_store_ids": ["vs_1"] } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "thread_abc"})))
        .expect(1)
        .mount(&server)
        .await;

    let handle = backend(&server, Some("vs_1")).create_session().await.unwrap();
    assert_eq!(handle, SessionHandle::new("thread_abc"));
}

#[tokio::test]
async fn list_messages_is_newest_first_with_joined_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/messages"))
        .and(query_param("order", "desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [
                {"id": "msg_2", "role": "assistant", "run_id": "run_1",
                 "content": [{"type": "text", "text": {"value": "Be still.", "annotations": []}}]},
                {"id": "msg_1", "role": "user", "run_id": null,
                 "content": [{"type": "text", "text": {"value": "How?", "annotations": []}}]}
            ]
        })))
        .mount(&server)
        .await;

    let messages = backend(&server, None)
        .list_messages(&SessionHandle::new("thread_1"))
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::Assistant);
    assert_eq!(messages[0].text, "Be still.");
    assert_eq!(messages[1].run_id, None);
}

#[tokio::test]
async fn polled_turn_through_chat_session() {
    let server = MockServer::start().await;
    mount_thread_and_message(&server).await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .and(body_partial_json(json!({"assistant_id": "asst_1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(run_json("queued")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(run_json("in_progress")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(run_json("completed")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/messages"))
        .and(query_param("order", "desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "id": "msg_reply",
                "role": "assistant",
                "run_id": "run_1",
                "content": [{"type": "text", "text": {"value": "Breathe 【4:0†source】in.", "annotations": []}}]
            }]
        })))
        .mount(&server)
        .await;

    let mut session = ChatSession::new(
        Arc::new(backend(&server, None)),
        "asst_1",
        settings(DriveStrategy::Poll),
        default_personas(),
    );
    let outcome = session
        .send("스님AI", "how do I start?", CancellationToken::new(), |_| {})
        .await;

    let TurnOutcome::Replied(turn) = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(turn.content, "Breathe in.");
    assert_eq!(turn.remote_message_id.as_deref(), Some("msg_reply"));
    assert_eq!(session.history("스님AI").len(), 2);
}

#[tokio::test]
async fn thread_creation_error_surfaces_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/threads"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = backend(&server, None).create_session().await.unwrap_err();
    match err {
        BackendError::Status { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "upstream down");
        }
        other => panic!("expected a status error, got {other:?}"),
    }

    let mut session = ChatSession::new(
        Arc::new(backend(&server, None)),
        "asst_1",
        settings(DriveStrategy::Poll),
        default_personas(),
    );
    let outcome = session
        .send("스님AI", "hello", CancellationToken::new(), |_| {})
        .await;
    match outcome {
        TurnOutcome::Failed {
            error: ChatError::SessionCreation(BackendError::Status { status, .. }),
            ..
        } => assert_eq!(status, 500),
        other => panic!("expected a session creation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_run_reports_last_error() {
    let server = MockServer::start().await;
    mount_thread_and_message(&server).await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(run_json("queued")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_1",
            "thread_id": "thread_1",
            "status": "failed",
            "last_error": {"code": "server_error", "message": "Something went wrong."}
        })))
        .mount(&server)
        .await;

    let backend: Arc<dyn ConversationBackend> = Arc::new(backend(&server, None));
    let driver = RunDriver::new(backend.clone(), "asst_1", settings(DriveStrategy::Poll));
    let session = backend.create_session().await.unwrap();
    let persona = Persona::new("스님AI", "🧘");
    let run = driver.submit(&session, &persona, "hello").await.unwrap();

    let stream = driver.drive(run, CancellationToken::new());
    match driver.finalize(stream).await {
        Err(ChatError::RunFailed { reason }) => assert_eq!(reason, "Something went wrong."),
        other => panic!("expected RunFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn streamed_run_yields_deltas() {
    let server = MockServer::start().await;
    mount_thread_and_message(&server).await;

    let run = |status: &str| run_json(status).to_string();
    let delta = |text: &str| {
        json!({
            "id": "msg_s",
            "object": "thread.message.delta",
            "delta": {"content": [{"index": 0, "type": "text", "text": {"value": text}}]}
        })
        .to_string()
    };
    let body = format!(
        "event: thread.run.created\ndata: {}\n\n\
         event: thread.run.in_progress\ndata: {}\n\n\
         event: thread.run.step.created\ndata: {{}}\n\n\
         event: thread.message.delta\ndata: {}\n\n\
         event: thread.message.delta\ndata: {}\n\n\
         event: thread.run.completed\ndata: {}\n\n\
         event: done\ndata: [DONE]\n\n",
        run("queued"),
        run("in_progress"),
        delta("Let go "),
        delta("gently."),
        run("completed"),
    );
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let backend: Arc<dyn ConversationBackend> = Arc::new(backend(&server, None));
    let driver = RunDriver::new(backend.clone(), "asst_1", settings(DriveStrategy::Stream));
    let session = backend.create_session().await.unwrap();
    let run = driver
        .submit(&session, &Persona::new("MZ스님", "🙏"), "hi")
        .await
        .unwrap();
    assert_eq!(run.run_id, "run_1");

    let mut stream = driver.drive(run, CancellationToken::new());
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }
    let reply = driver.finalize(stream).await.unwrap();

    assert_eq!(
        chunks,
        vec![Chunk::Delta("Let go ".into()), Chunk::Delta("gently.".into())]
    );
    assert_eq!(reply.text, "Let go gently.");
    assert_eq!(reply.message_id.as_deref(), Some("msg_s"));
}
