use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use uuid::Uuid;

use super::{ConversationBackend, EventStream};
use crate::error::BackendError;
use crate::events::{
    BackendMessage, Role, RunError, RunOptions, RunPhase, RunRef, RunSnapshot, RunStatus,
    SessionHandle, StreamEvent,
};

/// What a completed run answers
#[derive(Debug, Clone)]
enum ReplyScript {
    Fixed(String),
    /// Repeat the thread's latest user message back
    Echo,
    /// Complete without adding any message
    Nothing,
}

#[derive(Debug)]
struct RunProgress {
    session: SessionHandle,
    polls: usize,
    replied: bool,
}

#[derive(Debug)]
struct ScriptState {
    statuses: Vec<RunStatus>,
    reply: ReplyScript,
    run_error: Option<RunError>,
    stream_events: Option<Vec<StreamEvent>>,
    fail_create_session: bool,
    fail_post_message: bool,
    fail_create_run: bool,
    sessions: Vec<SessionHandle>,
    messages: HashMap<SessionHandle, Vec<BackendMessage>>,
    runs: HashMap<String, RunProgress>,
    run_options: Vec<RunOptions>,
    status_requests: u32,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            statuses: vec![RunStatus::Completed],
            reply: ReplyScript::Nothing,
            run_error: None,
            stream_events: None,
            fail_create_session: false,
            fail_post_message: false,
            fail_create_run: false,
            sessions: Vec::new(),
            messages: HashMap::new(),
            runs: HashMap::new(),
            run_options: Vec::new(),
            status_requests: 0,
        }
    }
}

/// In-memory backend that plays back a scripted run lifecycle.
///
/// Every run walks through the configured status sequence, one entry per
/// status request, repeating the last entry once the sequence is exhausted.
/// When a run first reports `completed` the scripted reply is added to its
/// thread. All calls are recorded for inspection.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
}

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend used by `--offline`: runs queue, progress, then echo the question.
    pub fn offline_demo() -> Self {
        Self::new()
            .with_statuses([RunStatus::Queued, RunStatus::InProgress, RunStatus::Completed])
            .with_echo_reply()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&mut self) -> &mut ScriptState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = RunStatus>) -> Self {
        let statuses: Vec<RunStatus> = statuses.into_iter().collect();
        if !statuses.is_empty() {
            self.state_mut().statuses = statuses;
        }
        self
    }

    pub fn with_reply(mut self, text: impl Into<String>) -> Self {
        self.state_mut().reply = ReplyScript::Fixed(text.into());
        self
    }

    pub fn with_echo_reply(mut self) -> Self {
        self.state_mut().reply = ReplyScript::Echo;
        self
    }

    /// `last_error` reported alongside failed statuses
    pub fn with_run_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.state_mut().run_error = Some(RunError {
            code: Some(code.into()),
            message: message.into(),
        });
        self
    }

    /// Events returned by `stream_run`. Without them the stream is derived
    /// from the status sequence end state and the reply.
    pub fn with_stream_events(mut self, events: Vec<StreamEvent>) -> Self {
        self.state_mut().stream_events = Some(events);
        self
    }

    pub fn set_fail_create_session(&self, fail: bool) {
        self.state().fail_create_session = fail;
    }

    pub fn set_fail_post_message(&self, fail: bool) {
        self.state().fail_post_message = fail;
    }

    pub fn set_fail_create_run(&self, fail: bool) {
        self.state().fail_create_run = fail;
    }

    /// Sessions created so far, oldest first
    pub fn sessions_created(&self) -> Vec<SessionHandle> {
        self.state().sessions.clone()
    }

    /// Messages of a thread in chronological order
    pub fn thread_messages(&self, session: &SessionHandle) -> Vec<BackendMessage> {
        self.state()
            .messages
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    pub fn runs_created(&self) -> Vec<RunOptions> {
        self.state().run_options.clone()
    }

    pub fn status_requests(&self) -> u32 {
        self.state().status_requests
    }
}

impl ScriptState {
    fn reply_for(&self, session: &SessionHandle) -> Option<String> {
        match &self.reply {
            ReplyScript::Fixed(text) => Some(text.clone()),
            ReplyScript::Echo => {
                let question = self
                    .messages
                    .get(session)?
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)?
                    .text
                    .clone();
                Some(format!(
                    "You asked: \"{question}\". Sit with the question a while; the answer is already breathing in it."
                ))
            }
            ReplyScript::Nothing => None,
        }
    }

    fn add_reply(&mut self, session: &SessionHandle, run_id: &str) -> Option<String> {
        let text = self.reply_for(session)?;
        self.messages
            .entry(session.clone())
            .or_default()
            .push(BackendMessage {
                id: new_id("msg"),
                role: Role::Assistant,
                run_id: Some(run_id.to_string()),
                text: text.clone(),
            });
        Some(text)
    }

    fn final_status(&self) -> RunStatus {
        self.statuses
            .last()
            .copied()
            .unwrap_or(RunStatus::Completed)
    }
}

#[async_trait]
impl ConversationBackend for ScriptedBackend {
    async fn create_session(&self) -> Result<SessionHandle, BackendError> {
        let mut state = self.state();
        if state.fail_create_session {
            return Err(BackendError::Rejected("thread creation refused".into()));
        }
        let handle = SessionHandle::new(new_id("thread"));
        state.sessions.push(handle.clone());
        state.messages.insert(handle.clone(), Vec::new());
        Ok(handle)
    }

    async fn post_message(
        &self,
        session: &SessionHandle,
        role: Role,
        text: &str,
    ) -> Result<String, BackendError> {
        let mut state = self.state();
        if state.fail_post_message {
            return Err(BackendError::Rejected("message refused".into()));
        }
        let Some(messages) = state.messages.get_mut(session) else {
            return Err(BackendError::Status {
                status: 404,
                body: format!("no thread {session}"),
            });
        };
        let id = new_id("msg");
        messages.push(BackendMessage {
            id: id.clone(),
            role,
            run_id: None,
            text: text.to_string(),
        });
        Ok(id)
    }

    async fn create_run(
        &self,
        session: &SessionHandle,
        options: &RunOptions,
    ) -> Result<RunRef, BackendError> {
        let mut state = self.state();
        if state.fail_create_run {
            return Err(BackendError::Rejected("run refused".into()));
        }
        if !state.messages.contains_key(session) {
            return Err(BackendError::Status {
                status: 404,
                body: format!("no thread {session}"),
            });
        }
        let run_id = new_id("run");
        state.run_options.push(options.clone());
        state.runs.insert(
            run_id.clone(),
            RunProgress {
                session: session.clone(),
                polls: 0,
                replied: false,
            },
        );
        Ok(RunRef {
            session: session.clone(),
            run_id,
        })
    }

    async fn get_run_status(&self, run: &RunRef) -> Result<RunSnapshot, BackendError> {
        let mut state = self.state();
        state.status_requests += 1;

        let Some(progress) = state.runs.get_mut(&run.run_id) else {
            return Err(BackendError::Status {
                status: 404,
                body: format!("no run {}", run.run_id),
            });
        };
        let index = progress.polls;
        progress.polls += 1;
        let session = progress.session.clone();
        let already_replied = progress.replied;

        let status = state
            .statuses
            .get(index)
            .copied()
            .unwrap_or_else(|| state.final_status());

        if status == RunStatus::Completed && !already_replied {
            state.add_reply(&session, &run.run_id);
            if let Some(progress) = state.runs.get_mut(&run.run_id) {
                progress.replied = true;
            }
        }

        let last_error = match status.phase() {
            RunPhase::Failed => state.run_error.clone(),
            _ => None,
        };
        Ok(RunSnapshot {
            run_id: run.run_id.clone(),
            status,
            last_error,
        })
    }

    async fn list_messages(
        &self,
        session: &SessionHandle,
    ) -> Result<Vec<BackendMessage>, BackendError> {
        let state = self.state();
        let Some(messages) = state.messages.get(session) else {
            return Err(BackendError::Status {
                status: 404,
                body: format!("no thread {session}"),
            });
        };
        Ok(messages.iter().rev().cloned().collect())
    }

    async fn stream_run(&self, run: &RunRef) -> Result<EventStream, BackendError> {
        let mut state = self.state();
        if let Some(events) = state.stream_events.clone() {
            return Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed());
        }

        let session = match state.runs.get(&run.run_id) {
            Some(progress) => progress.session.clone(),
            None => {
                return Err(BackendError::Protocol(format!(
                    "no open stream for run {}",
                    run.run_id
                )));
            }
        };

        let status = state.final_status();
        let mut events = vec![StreamEvent::Status(RunSnapshot {
            run_id: run.run_id.clone(),
            status: RunStatus::InProgress,
            last_error: None,
        })];
        if status == RunStatus::Completed {
            if let Some(text) = state.add_reply(&session, &run.run_id) {
                events.extend(text.split_inclusive(char::is_whitespace).map(|word| {
                    StreamEvent::TextDelta {
                        message_id: None,
                        text: word.to_string(),
                    }
                }));
            }
        }
        events.push(StreamEvent::Status(RunSnapshot {
            run_id: run.run_id.clone(),
            status,
            last_error: if status.phase() == RunPhase::Failed {
                state.run_error.clone()
            } else {
                None
            },
        }));
        events.push(StreamEvent::Done);

        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walks_status_sequence_and_replies_once() {
        let backend = ScriptedBackend::new()
            .with_statuses([RunStatus::Queued, RunStatus::Completed])
            .with_reply("peace");
        let session = backend.create_session().await.unwrap();
        backend.post_message(&session, Role::User, "hi").await.unwrap();
        let run = backend
            .create_run(&session, &RunOptions::default())
            .await
            .unwrap();

        let statuses = [
            backend.get_run_status(&run).await.unwrap().status,
            backend.get_run_status(&run).await.unwrap().status,
            backend.get_run_status(&run).await.unwrap().status,
        ];
        assert_eq!(
            statuses,
            [RunStatus::Queued, RunStatus::Completed, RunStatus::Completed]
        );
        assert_eq!(backend.status_requests(), 3);

        let listed = backend.list_messages(&session).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].role, Role::Assistant);
        assert_eq!(listed[0].text, "peace");
        assert_eq!(listed[0].run_id.as_deref(), Some(run.run_id.as_str()));
        assert_eq!(listed[1].text, "hi");
    }

    #[tokio::test]
    async fn echo_reply_quotes_latest_question() {
        let backend = ScriptedBackend::offline_demo();
        let session = backend.create_session().await.unwrap();
        backend
            .post_message(&session, Role::User, "what is zen?")
            .await
            .unwrap();
        let run = backend
            .create_run(&session, &RunOptions::default())
            .await
            .unwrap();
        for _ in 0..3 {
            backend.get_run_status(&run).await.unwrap();
        }
        let listed = backend.list_messages(&session).await.unwrap();
        assert!(listed[0].text.contains("what is zen?"));
    }

    #[tokio::test]
    async fn failure_switches() {
        let backend = ScriptedBackend::new();
        backend.set_fail_create_session(true);
        assert!(backend.create_session().await.is_err());
        backend.set_fail_create_session(false);
        let session = backend.create_session().await.unwrap();

        backend.set_fail_post_message(true);
        assert!(backend.post_message(&session, Role::User, "x").await.is_err());
        assert!(backend.thread_messages(&session).is_empty());
    }
}
