use std::io::{self, Stdout, Write};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::commands::{ParsedCommand, SlashCommand, get_help_text, parse_slash_command};
use super::render::{Renderer, StatusType};
use crate::chat::{ChatSession, TurnOutcome};
use crate::config::{Persona, UiConfig};
use crate::events::Turn;

/// Actions that can be requested by a slash command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplAction {
    Continue,
    Exit,
}

/// Forward every Ctrl-C for the rest of the program.
///
/// Once tokio handles SIGINT the default action is gone for good, so a single
/// listener lives as long as the REPL and each wait selects on its receiver.
pub fn interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Await `work`. The first interrupt cancels `cancel`, after which `work` is
/// still awaited so it can wind down and report.
pub async fn cancel_on_interrupt<F: Future>(
    work: F,
    cancel: &CancellationToken,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> F::Output {
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => output,
        Some(()) = interrupts.recv() => {
            cancel.cancel();
            work.await
        }
    }
}

/// Find a persona by exact name or by its 1-based position in the list.
pub fn resolve_persona<'a>(personas: &'a [Persona], query: &str) -> Option<&'a Persona> {
    let query = query.trim();
    personas
        .iter()
        .find(|p| p.name == query)
        .or_else(|| {
            let index: usize = query.parse().ok()?;
            personas.get(index.checked_sub(1)?)
        })
        .or_else(|| {
            personas
                .iter()
                .find(|p| p.name.to_lowercase() == query.to_lowercase())
        })
}

/// Interactive chat loop on stdin/stdout
pub struct Repl {
    session: ChatSession,
    renderer: Renderer<Stdout>,
    ui: UiConfig,
    current: Persona,
}

impl Repl {
    pub fn new(session: ChatSession, ui: UiConfig, persona: Persona) -> Self {
        Self {
            session,
            renderer: Renderer::new(io::stdout(), ui.user_icon.clone()),
            ui,
            current: persona,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.show_persona()?;
        self.renderer
            .status("Type /help for commands.", StatusType::Info)?;

        let mut interrupts = interrupts();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.renderer.plain(&format!("{} ▸ ", self.ui.user_icon))?;
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read user input")?,
                Some(()) = interrupts.recv() => {
                    self.renderer.plain("\n")?;
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };

            let input = line.trim();
            if input.is_empty() {
                continue;
            }

            if let Some(command) = parse_slash_command(input) {
                if self.handle_command(&command).await? == ReplAction::Exit {
                    break;
                }
                continue;
            }
            if input.starts_with('/') {
                self.renderer.status(
                    &format!("Unknown command '{input}'. Type /help for commands."),
                    StatusType::Warning,
                )?;
                continue;
            }

            self.ask(input, &mut interrupts).await?;
            // Presses that arrived while the reply was finishing.
            while interrupts.try_recv().is_ok() {}
        }

        self.renderer.plain("\n🙏 Goodbye.\n")?;
        Ok(())
    }

    /// Send one message; a Ctrl-C while the reply is produced cancels it
    async fn ask(
        &mut self,
        input: &str,
        interrupts: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<()> {
        let persona = self.current.clone();
        self.renderer.turn(&Turn::user(input), &persona)?;
        self.renderer.begin_reply(&persona)?;

        let cancel = CancellationToken::new();
        let renderer = &mut self.renderer;
        let mut render_error: Option<io::Error> = None;
        let send = self
            .session
            .send(&persona.name, input, cancel.clone(), |chunk| {
                if render_error.is_none() {
                    if let Err(e) = renderer.push_chunk(chunk.text()) {
                        render_error = Some(e);
                    }
                }
            });
        let outcome = cancel_on_interrupt(send, &cancel, interrupts).await;

        self.renderer.end_reply()?;
        if let Some(e) = render_error {
            return Err(e).context("Failed to draw reply");
        }

        if let TurnOutcome::Failed { notice, .. } = outcome {
            self.renderer.status(&notice, StatusType::Error)?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: &ParsedCommand) -> Result<ReplAction> {
        match command.command {
            SlashCommand::Bye => return Ok(ReplAction::Exit),
            SlashCommand::Help => self.renderer.plain(&format!("{}\n\n", get_help_text()))?,
            SlashCommand::Personas => self.list_personas()?,
            SlashCommand::History => self.show_history()?,
            SlashCommand::Persona => {
                let Some(query) = command.argument() else {
                    self.list_personas()?;
                    return Ok(ReplAction::Continue);
                };
                match resolve_persona(self.session.personas(), query).cloned() {
                    Some(persona) => {
                        self.current = persona;
                        self.show_persona()?;
                    }
                    None => self.renderer.status(
                        &format!("No persona named '{query}'. Type /personas to list them."),
                        StatusType::Warning,
                    )?,
                }
            }
            SlashCommand::Reset => {
                let name = self.current.name.clone();
                match self.session.reset(&name).await {
                    Ok(()) => self
                        .renderer
                        .status("Conversation cleared.", StatusType::Info)?,
                    Err(err) => self.renderer.status(
                        &format!("Conversation cleared. {}", err.user_notice()),
                        StatusType::Warning,
                    )?,
                }
                self.greet()?;
            }
        }
        Ok(ReplAction::Continue)
    }

    fn list_personas(&mut self) -> Result<()> {
        let mut listing = String::new();
        for (i, persona) in self.session.personas().iter().enumerate() {
            let marker = if persona.name == self.current.name { "▸" } else { " " };
            listing.push_str(&format!("{marker} {}. {} {}\n", i + 1, persona.icon, persona.name));
        }
        listing.push('\n');
        self.renderer.plain(&listing)?;
        Ok(())
    }

    /// Title, then either the stored conversation or a greeting
    fn show_persona(&mut self) -> Result<()> {
        let persona = self.current.clone();
        self.renderer.title(&persona)?;
        if self.session.store().is_empty(&persona.name) {
            self.greet()?;
        } else {
            self.show_history()?;
        }
        Ok(())
    }

    fn show_history(&mut self) -> Result<()> {
        let persona = self.current.clone();
        let turns = self.session.history(&persona.name).to_vec();
        if turns.is_empty() {
            self.renderer
                .status("No messages yet.", StatusType::Info)?;
        }
        for turn in &turns {
            self.renderer.turn(turn, &persona)?;
        }
        Ok(())
    }

    fn greet(&mut self) -> Result<()> {
        if self.ui.show_greeting {
            let greeting = format!(
                "Hello! You are now talking with {}. What would you like to ask?",
                self.current.name
            );
            self.renderer.status(&greeting, StatusType::Info)?;
        }
        io::stdout().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::ScriptedBackend;
    use crate::config::default_personas;
    use crate::driver::DriverSettings;
    use crate::error::ChatError;
    use crate::events::RunStatus;

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_reply_in_progress() {
        let backend = Arc::new(ScriptedBackend::new().with_statuses([RunStatus::InProgress]));
        let mut session =
            ChatSession::new(backend, "asst_test", DriverSettings::default(), default_personas());
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(()).unwrap();

        let cancel = CancellationToken::new();
        let send = session.send("스님AI", "hi", cancel.clone(), |_| {});
        let outcome = cancel_on_interrupt(send, &cancel, &mut rx).await;

        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                error: ChatError::Cancelled,
                ..
            }
        ));
        assert!(cancel.is_cancelled());
        assert_eq!(session.history("스님AI").len(), 1);
    }

    #[tokio::test]
    async fn closed_interrupt_channel_never_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        drop(tx);
        let cancel = CancellationToken::new();

        let output = cancel_on_interrupt(async { 7 }, &cancel, &mut rx).await;
        assert_eq!(output, 7);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn resolves_by_name_index_and_case() {
        let mut personas = default_personas();
        personas.push(Persona::new("Zen Teacher", "Z"));

        assert_eq!(resolve_persona(&personas, "MZ스님").unwrap().name, "MZ스님");
        assert_eq!(resolve_persona(&personas, "2").unwrap().name, "불교 경전 선생님");
        assert_eq!(
            resolve_persona(&personas, "zen teacher").unwrap().name,
            "Zen Teacher"
        );
    }

    #[test]
    fn unknown_or_out_of_range_is_none() {
        let personas = default_personas();
        assert!(resolve_persona(&personas, "0").is_none());
        assert!(resolve_persona(&personas, "9").is_none());
        assert!(resolve_persona(&personas, "nobody").is_none());
    }
}
