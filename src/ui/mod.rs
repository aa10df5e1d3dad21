//! Terminal chat interface

pub mod commands;
pub mod render;
pub mod repl;

pub use commands::{ParsedCommand, SlashCommand, get_help_text, parse_slash_command};
pub use render::{Renderer, StatusType};
pub use repl::{Repl, cancel_on_interrupt, interrupts, resolve_persona};
