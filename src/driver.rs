//! Run driver: submit a user turn, start a run and drive it to a terminal state.
//!
//! A run is driven by one of two strategies, picked once in configuration:
//!
//! - [`DriveStrategy::Poll`] asks for the run status at a fixed cadence. Once
//!   the run completes, the reply is fetched in one piece and replayed locally
//!   as [`Chunk::Replay`] pieces for a typing effect.
//! - [`DriveStrategy::Stream`] consumes the backend's event stream and forwards
//!   each text delta as a [`Chunk::Delta`] without added delay.
//!
//! Either way every wait is capped by `max_polls` and `timeout`, and a
//! [`CancellationToken`] is checked on every tick.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ConversationBackend;
use crate::config::{DriveStrategy, DriverConfig, Persona};
use crate::error::ChatError;
use crate::events::{
    BackendMessage, Chunk, DriveEvent, Reply, Role, RunOptions, RunPhase, RunRef, SessionHandle,
    StreamEvent,
};

/// Replies shorter than this are replayed character by character, longer ones word by word
const CHAR_REPLAY_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub strategy: DriveStrategy,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub timeout: Duration,
    pub typing_delay: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from(&DriverConfig::default())
    }
}

impl From<&DriverConfig> for DriverSettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            strategy: config.strategy,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            typing_delay: Duration::from_millis(config.typing_delay_ms),
        }
    }
}

/// Drives assistant runs against a [`ConversationBackend`]
#[derive(Clone)]
pub struct RunDriver {
    backend: Arc<dyn ConversationBackend>,
    assistant_id: String,
    settings: DriverSettings,
}

impl RunDriver {
    pub fn new(
        backend: Arc<dyn ConversationBackend>,
        assistant_id: impl Into<String>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            backend,
            assistant_id: assistant_id.into(),
            settings,
        }
    }

    /// Post `user_text` to the thread and start a run for `persona`.
    ///
    /// On failure the backend may have recorded nothing, or only the message.
    pub async fn submit(
        &self,
        session: &SessionHandle,
        persona: &Persona,
        user_text: &str,
    ) -> Result<RunRef, ChatError> {
        let message_id = self
            .backend
            .post_message(session, Role::User, user_text)
            .await
            .map_err(ChatError::Submission)?;
        debug!(thread_id = %session, message_id = %message_id, "posted user message");

        let options = RunOptions {
            assistant_id: self.assistant_id.clone(),
            additional_instructions: persona.instructions.clone(),
            stream: self.settings.strategy == DriveStrategy::Stream,
        };
        let run = self
            .backend
            .create_run(session, &options)
            .await
            .map_err(ChatError::Submission)?;
        info!(
            persona = %persona.name,
            thread_id = %session,
            run_id = %run.run_id,
            strategy = %self.settings.strategy,
            "started run"
        );
        Ok(run)
    }

    /// Start driving `run`. The returned stream yields text chunks as they
    /// become available and ends once the run reached a terminal state.
    pub fn drive(&self, run: RunRef, cancel: CancellationToken) -> RunStream {
        let (tx, rx) = mpsc::channel(64);
        let backend = self.backend.clone();
        let settings = self.settings.clone();
        let run_id = run.run_id.clone();

        tokio::spawn(async move {
            let outcome = match settings.strategy {
                DriveStrategy::Poll => {
                    poll_to_completion(backend.as_ref(), &run, &settings, &cancel, &tx).await
                }
                DriveStrategy::Stream => {
                    stream_deltas(backend.as_ref(), &run, &settings, &cancel, &tx).await
                }
            };
            let event = match outcome {
                Ok(reply) => DriveEvent::Completed(reply),
                Err(err) => {
                    warn!(run_id = %run.run_id, kind = err.kind(), error = %err, "run did not complete");
                    DriveEvent::Failed(err)
                }
            };
            let _ = tx.send(event).await;
        });

        RunStream {
            run_id,
            rx,
            phase: None,
            outcome: None,
        }
    }

    /// Wait for `stream` to finish and return the reply exactly as the
    /// backend reported it.
    pub async fn finalize(&self, stream: RunStream) -> Result<Reply, ChatError> {
        let run_id = stream.run_id.clone();
        let reply = stream.finalize().await?;
        debug!(run_id = %run_id, chars = reply.text.chars().count(), "run finalized");
        Ok(reply)
    }
}

/// Lazy, finite sequence of chunks produced while one run is driven.
///
/// Consumed once: it cannot be restarted, and dropping it stops the producer.
pub struct RunStream {
    run_id: String,
    rx: mpsc::Receiver<DriveEvent>,
    phase: Option<RunPhase>,
    outcome: Option<Result<Reply, ChatError>>,
}

impl RunStream {
    /// Last phase the run was observed in
    pub fn phase(&self) -> Option<RunPhase> {
        self.phase
    }

    /// Drain the remaining chunks and return the run's outcome
    pub async fn finalize(mut self) -> Result<Reply, ChatError> {
        while self.next().await.is_some() {}
        self.outcome
            .take()
            .unwrap_or_else(|| Err(ChatError::run_failed("driver stopped without a result")))
    }
}

impl Stream for RunStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        loop {
            match ready!(self.rx.poll_recv(cx)) {
                None => return Poll::Ready(None),
                Some(DriveEvent::Chunk(chunk)) => return Poll::Ready(Some(chunk)),
                Some(DriveEvent::Status(phase)) => self.phase = Some(phase),
                Some(DriveEvent::Completed(reply)) => {
                    self.phase = Some(RunPhase::Completed);
                    self.outcome = Some(Ok(reply));
                }
                Some(DriveEvent::Failed(err)) => {
                    self.phase = Some(RunPhase::Failed);
                    self.outcome = Some(Err(err));
                }
            }
        }
    }
}

/// Send an event, treating a dropped receiver as cancellation
async fn emit(tx: &mpsc::Sender<DriveEvent>, event: DriveEvent) -> Result<(), ChatError> {
    tx.send(event).await.map_err(|_| ChatError::Cancelled)
}

async fn poll_to_completion(
    backend: &dyn ConversationBackend,
    run: &RunRef,
    settings: &DriverSettings,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<DriveEvent>,
) -> Result<Reply, ChatError> {
    let started = Instant::now();
    let deadline = started + settings.timeout;
    let mut polls = 0u32;
    let mut last_phase = None;

    loop {
        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        if polls >= settings.max_polls || Instant::now() >= deadline {
            return Err(ChatError::Timeout {
                polls,
                elapsed: started.elapsed(),
            });
        }

        polls += 1;
        let snapshot = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            result = timeout_at(deadline, backend.get_run_status(run)) => match result {
                Err(_) => {
                    return Err(ChatError::Timeout {
                        polls,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(status) => status.map_err(|e| {
                    ChatError::run_failed(format!("status request failed: {e}"))
                })?,
            },
        };
        let phase = snapshot.status.phase();
        debug!(run_id = %run.run_id, status = %snapshot.status, polls, "polled run");

        if last_phase != Some(phase) {
            last_phase = Some(phase);
            emit(tx, DriveEvent::Status(phase)).await?;
        }
        match phase {
            RunPhase::Completed => break,
            RunPhase::Failed => return Err(ChatError::run_failed(snapshot.failure_reason())),
            RunPhase::Queued | RunPhase::InProgress => {}
        }

        let wake = (Instant::now() + settings.poll_interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            _ = sleep_until(wake) => {}
        }
    }

    let messages = tokio::select! {
        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
        result = timeout_at(deadline, backend.list_messages(&run.session)) => match result {
            Err(_) => {
                return Err(ChatError::Timeout {
                    polls,
                    elapsed: started.elapsed(),
                });
            }
            Ok(messages) => messages
                .map_err(|e| ChatError::run_failed(format!("could not fetch reply: {e}")))?,
        },
    };
    let reply = pick_reply(&messages, &run.run_id).ok_or_else(ChatError::empty_response)?;
    info!(run_id = %run.run_id, polls, elapsed = ?started.elapsed(), "run completed");

    let mut pieces = replay_chunks(&reply.text).into_iter();
    while let Some(piece) = pieces.next() {
        emit(tx, DriveEvent::Chunk(Chunk::Replay(piece))).await?;
        if settings.typing_delay.is_zero() {
            continue;
        }
        let out_of_time = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            _ = sleep_until(deadline) => true,
            _ = sleep(settings.typing_delay) => false,
        };
        if out_of_time {
            // The reply is complete; show the rest at once.
            let rest: String = pieces.by_ref().collect();
            if !rest.is_empty() {
                emit(tx, DriveEvent::Chunk(Chunk::Replay(rest))).await?;
            }
            debug!(run_id = %run.run_id, "typing replay cut short by the deadline");
        }
    }
    Ok(reply)
}

async fn stream_deltas(
    backend: &dyn ConversationBackend,
    run: &RunRef,
    settings: &DriverSettings,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<DriveEvent>,
) -> Result<Reply, ChatError> {
    let started = Instant::now();
    let deadline = started + settings.timeout;
    let timed_out = |events: u32| ChatError::Timeout {
        polls: events,
        elapsed: started.elapsed(),
    };

    let mut events = match timeout_at(deadline, backend.stream_run(run)).await {
        Err(_) => return Err(timed_out(0)),
        Ok(opened) => opened
            .map_err(|e| ChatError::run_failed(format!("could not open run stream: {e}")))?,
    };

    let mut text = String::new();
    let mut message_id = None;
    let mut received = 0u32;
    let mut last_phase = None;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            next = timeout_at(deadline, events.next()) => next.map_err(|_| timed_out(received))?,
        };
        let event = match next {
            None => break,
            Some(event) => {
                event.map_err(|e| ChatError::run_failed(format!("stream interrupted: {e}")))?
            }
        };
        received += 1;

        match event {
            StreamEvent::TextDelta {
                message_id: id,
                text: delta,
            } => {
                if message_id.is_none() {
                    message_id = id;
                }
                text.push_str(&delta);
                emit(tx, DriveEvent::Chunk(Chunk::Delta(delta))).await?;
            }
            StreamEvent::Status(snapshot) => {
                let phase = snapshot.status.phase();
                if last_phase != Some(phase) {
                    last_phase = Some(phase);
                    emit(tx, DriveEvent::Status(phase)).await?;
                }
                if phase == RunPhase::Failed {
                    return Err(ChatError::run_failed(snapshot.failure_reason()));
                }
            }
            StreamEvent::Error(message) => return Err(ChatError::run_failed(message)),
            StreamEvent::RunCreated { .. } => {}
            StreamEvent::Done => break,
        }
    }

    if text.trim().is_empty() {
        return Err(ChatError::empty_response());
    }
    info!(run_id = %run.run_id, events = received, elapsed = ?started.elapsed(), "run completed");
    Ok(Reply { text, message_id })
}

/// The assistant message produced by `run_id`, from a most-recent-first listing.
///
/// Falls back to the newest assistant message when none carries `run_id`. An
/// empty message counts as no reply.
fn pick_reply(messages: &[BackendMessage], run_id: &str) -> Option<Reply> {
    let mut assistant = messages.iter().filter(|m| m.role == Role::Assistant);
    let newest = assistant.clone().next();
    assistant
        .find(|m| m.run_id.as_deref() == Some(run_id))
        .or(newest)
        .filter(|m| !m.text.trim().is_empty())
        .map(|m| Reply {
            text: m.text.clone(),
            message_id: Some(m.id.clone()),
        })
}

/// Split a finished reply into the pieces of the typing replay.
///
/// Short replies go character by character, longer ones word by word with
/// the following whitespace attached. Concatenating the pieces gives back
/// `text` exactly.
pub fn replay_chunks(text: &str) -> Vec<String> {
    if text.chars().count() < CHAR_REPLAY_LIMIT {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: Role, run_id: Option<&str>, text: &str) -> BackendMessage {
        BackendMessage {
            id: format!("msg_{text}"),
            role,
            run_id: run_id.map(str::to_string),
            text: text.to_string(),
        }
    }

    #[test]
    fn short_reply_replays_per_character() {
        let chunks = replay_chunks("선정 🙏");
        assert_eq!(chunks, vec!["선", "정", " ", "🙏"]);
    }

    #[test]
    fn long_reply_replays_per_word_and_reassembles() {
        let text = "The mind is like water.  When it is turbulent,\nit is difficult to see.";
        let chunks = replay_chunks(text);
        assert!(chunks.len() > 5);
        assert!(chunks.len() < text.chars().count());
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn picks_reply_of_this_run() {
        let messages = vec![
            message(Role::Assistant, Some("run_2"), "newer"),
            message(Role::Assistant, Some("run_1"), "mine"),
            message(Role::User, None, "question"),
        ];
        let reply = pick_reply(&messages, "run_1").unwrap();
        assert_eq!(reply.text, "mine");
        assert_eq!(reply.message_id.as_deref(), Some("msg_mine"));
    }

    #[test]
    fn falls_back_to_newest_assistant_message() {
        let messages = vec![
            message(Role::User, None, "again"),
            message(Role::Assistant, Some("run_other"), "newest answer"),
            message(Role::Assistant, Some("run_0"), "old answer"),
        ];
        let reply = pick_reply(&messages, "run_1").unwrap();
        assert_eq!(reply.text, "newest answer");
    }

    #[test]
    fn no_assistant_message_is_no_reply() {
        let messages = vec![message(Role::User, None, "question")];
        assert_eq!(pick_reply(&messages, "run_1"), None);
    }

    #[test]
    fn blank_reply_is_no_reply() {
        let messages = vec![message(Role::Assistant, Some("run_1"), "  ")];
        assert_eq!(pick_reply(&messages, "run_1"), None);
    }

    #[test]
    fn settings_from_config() {
        let settings = DriverSettings::from(&DriverConfig {
            max_polls: 0,
            ..DriverConfig::default()
        });
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.timeout, Duration::from_secs(60));
        assert_eq!(settings.max_polls, 1);
    }
}
