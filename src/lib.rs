//! monkchat: talk to hosted assistant personas from the terminal.
//!
//! A user turn flows through the crate as follows: the [`ChatSession`] stores
//! the user turn, makes sure the persona has a remote thread
//! ([`SessionManager`]), lets the [`RunDriver`] submit the message and drive
//! the resulting run to completion, strips citation markers with
//! [`postprocess::clean`] and stores the assistant turn.

pub mod backend;
pub mod chat;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod postprocess;
pub mod session;
pub mod store;
pub mod ui;

pub use backend::{AssistantsBackend, ConversationBackend, ScriptedBackend};
pub use chat::{ChatSession, TurnOutcome};
pub use config::{Config, DriveStrategy, Persona, Secrets};
pub use driver::{DriverSettings, RunDriver, RunStream};
pub use error::{BackendError, ChatError, ConfigError};
pub use events::{Chunk, Reply, Role, RunPhase, RunRef, RunStatus, SessionHandle, StreamEvent, Turn};
pub use session::SessionManager;
pub use store::ConversationStore;
