use std::io::{self, Write};

use crossterm::cursor::MoveLeft;
use crossterm::queue;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};

use crate::config::Persona;
use crate::events::{Role, Turn};

/// Typing cursor shown at the end of a reply that is still arriving
pub const CURSOR: &str = "▌";
const GUTTER: &str = "│ ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    Info,
    Warning,
    Error,
}

/// Draws chat bubbles on a terminal (or any writer)
pub struct Renderer<W: Write> {
    out: W,
    user_icon: String,
    cursor_visible: bool,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, user_icon: impl Into<String>) -> Self {
        Self {
            out,
            user_icon: user_icon.into(),
            cursor_visible: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn title(&mut self, persona: &Persona) -> io::Result<()> {
        queue!(
            self.out,
            SetAttribute(Attribute::Bold),
            Print(format!("{} Conversation with {}\n\n", persona.icon, persona.name)),
            SetAttribute(Attribute::Reset),
        )?;
        self.out.flush()
    }

    fn header(&mut self, role: Role, persona: &Persona) -> io::Result<()> {
        let (color, label) = match role {
            Role::User => (Color::Blue, format!("{} You", self.user_icon)),
            Role::Assistant => (Color::Green, format!("{} {}", persona.icon, persona.name)),
        };
        queue!(
            self.out,
            SetForegroundColor(color),
            Print(label),
            ResetColor,
            Print("\n"),
        )
    }

    fn body(&mut self, text: &str) -> io::Result<()> {
        queue!(self.out, Print(text.replace('\n', &format!("\n{GUTTER}"))))
    }

    /// A finished turn as a complete bubble
    pub fn turn(&mut self, turn: &Turn, persona: &Persona) -> io::Result<()> {
        self.header(turn.role, persona)?;
        queue!(self.out, Print(GUTTER))?;
        self.body(&turn.content)?;
        queue!(self.out, Print("\n\n"))?;
        self.out.flush()
    }

    /// Open the bubble of a reply that will arrive in chunks
    pub fn begin_reply(&mut self, persona: &Persona) -> io::Result<()> {
        self.header(Role::Assistant, persona)?;
        queue!(self.out, Print(GUTTER), Print(CURSOR))?;
        self.cursor_visible = true;
        self.out.flush()
    }

    pub fn push_chunk(&mut self, text: &str) -> io::Result<()> {
        self.hide_cursor()?;
        self.body(text)?;
        queue!(self.out, Print(CURSOR))?;
        self.cursor_visible = true;
        self.out.flush()
    }

    /// Close the reply bubble, removing the typing cursor
    pub fn end_reply(&mut self) -> io::Result<()> {
        self.hide_cursor()?;
        queue!(self.out, Print("\n\n"))?;
        self.out.flush()
    }

    pub fn status(&mut self, message: &str, status: StatusType) -> io::Result<()> {
        let (color, icon) = match status {
            StatusType::Info => (Color::Blue, "ℹ️ "),
            StatusType::Warning => (Color::Yellow, "⚠️ "),
            StatusType::Error => (Color::Red, "❌ "),
        };
        queue!(
            self.out,
            SetForegroundColor(color),
            Print(icon),
            ResetColor,
            Print(message),
            Print("\n"),
        )?;
        self.out.flush()
    }

    pub fn plain(&mut self, text: &str) -> io::Result<()> {
        queue!(self.out, Print(text))?;
        self.out.flush()
    }

    fn hide_cursor(&mut self) -> io::Result<()> {
        if self.cursor_visible {
            queue!(self.out, MoveLeft(1), Clear(ClearType::UntilNewLine))?;
            self.cursor_visible = false;
        }
        Ok(())
    }
}
