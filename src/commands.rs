use anyhow::{Context, Result};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use monkchat::backend::{AssistantsBackend, ConversationBackend, ScriptedBackend};
use monkchat::chat::{ChatSession, TurnOutcome};
use monkchat::config::{Config, Persona, Secrets};
use monkchat::ui::{Repl, cancel_on_interrupt, interrupts, resolve_persona};

/// Build a chat session against the remote API, or the scripted one when offline.
///
/// Secrets are only required for the remote API; a missing one stops startup.
fn build_session(config: &Config, offline: bool) -> Result<ChatSession> {
    let (backend, assistant_id): (Arc<dyn ConversationBackend>, String) = if offline {
        (Arc::new(ScriptedBackend::offline_demo()), "offline".to_string())
    } else {
        let secrets = Secrets::load(&config.secrets_path())?;
        let backend = AssistantsBackend::new(
            config.base_url.clone(),
            &secrets,
            Duration::from_secs(config.driver.request_timeout_secs),
        )
        .context("Failed to create HTTP client")?;
        (Arc::new(backend), secrets.assistant_id)
    };

    Ok(ChatSession::from_config(backend, assistant_id, config))
}

fn pick_persona(config: &Config, query: Option<&str>) -> Result<Persona> {
    let persona = match query {
        Some(query) => resolve_persona(&config.personas, query)
            .ok_or_else(|| anyhow::anyhow!("Persona '{}' not found. Run 'monkchat personas' to list them.", query))?,
        None => config
            .default_persona()
            .ok_or_else(|| anyhow::anyhow!("No personas configured"))?,
    };
    Ok(persona.clone())
}

fn write_chunk(out: &mut impl Write, text: &str) -> io::Result<()> {
    out.write_all(text.as_bytes())?;
    out.flush()
}

pub fn list_personas(config: &Config) -> Result<()> {
    println!("🧘 Available personas:");
    println!("{}", "=".repeat(40));
    for (i, persona) in config.personas.iter().enumerate() {
        println!("{}. {} {}", i + 1, persona.icon, persona.name);
    }
    Ok(())
}

pub async fn chat(config: &Config, offline: bool, persona: Option<&str>) -> Result<()> {
    let persona = pick_persona(config, persona)?;
    let session = build_session(config, offline)?;
    Repl::new(session, config.ui.clone(), persona).run().await
}

pub async fn ask(config: &Config, offline: bool, persona: Option<&str>, message: &str) -> Result<()> {
    let persona = pick_persona(config, persona)?;
    let mut session = build_session(config, offline)?;

    let cancel = CancellationToken::new();
    let mut interrupts = interrupts();

    let mut stdout = io::stdout();
    let mut write_error: Option<io::Error> = None;
    print!("{} ", persona.icon);
    let send = session.send(&persona.name, message, cancel.clone(), |chunk| {
        if write_error.is_none() {
            if let Err(e) = write_chunk(&mut stdout, chunk.text()) {
                write_error = Some(e);
            }
        }
    });
    let outcome = cancel_on_interrupt(send, &cancel, &mut interrupts).await;
    println!();
    if let Some(e) = write_error {
        return Err(e).context("Failed to write reply");
    }

    match outcome {
        TurnOutcome::Replied(_) => Ok(()),
        TurnOutcome::Failed { notice, error } => {
            Err(anyhow::Error::new(error).context(notice))
        }
    }
}
