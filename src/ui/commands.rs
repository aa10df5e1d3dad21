use std::str::FromStr;

use strum::{AsRefStr, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Commands that can be invoked by starting a message with a leading slash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, AsRefStr, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum SlashCommand {
    /// Talk to a different persona
    Persona,
    /// List the available personas
    Personas,
    /// Clear the conversation with the current persona
    Reset,
    /// Show the conversation so far
    History,
    /// Exit the application
    Bye,
    /// Show help
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: SlashCommand,
    pub argument: Option<String>,
}

impl ParsedCommand {
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }
}

impl SlashCommand {
    /// User-visible description shown in help.
    pub fn description(self) -> &'static str {
        match self {
            SlashCommand::Persona => "talk to a different persona (/persona <name or number>)",
            SlashCommand::Personas => "list the available personas",
            SlashCommand::Reset => "clear the conversation with the current persona",
            SlashCommand::History => "show the conversation so far",
            SlashCommand::Bye => "exit the application",
            SlashCommand::Help => "show available commands",
        }
    }

    /// Command string without the leading '/'.
    pub fn command(self) -> &'static str {
        self.into()
    }
}

/// Parse a slash command from user input
pub fn parse_slash_command(input: &str) -> Option<ParsedCommand> {
    let rest = input.trim().strip_prefix('/')?;

    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    let tail: Vec<&str> = parts.collect();

    let command = SlashCommand::from_str(&head.to_lowercase())
        .ok()
        .or_else(|| match head.to_lowercase().as_str() {
            "q" | "quit" | "exit" => Some(SlashCommand::Bye),
            "p" | "switch" => Some(SlashCommand::Persona),
            "clear" => Some(SlashCommand::Reset),
            "h" | "?" => Some(SlashCommand::Help),
            _ => None,
        })?;

    let argument = if tail.is_empty() {
        None
    } else {
        Some(tail.join(" "))
    };

    Some(ParsedCommand { command, argument })
}

/// Get help text for all available commands
pub fn get_help_text() -> String {
    let mut help = String::from("Available commands:\n\n");
    for command in SlashCommand::iter() {
        help.push_str(&format!("/{} - {}\n", command.command(), command.description()));
    }
    help.push_str("\nAliases: /q for /bye, /p for /persona, /clear for /reset, /h for /help");
    help
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_with_argument() {
        let parsed = parse_slash_command("/persona MZ스님").unwrap();
        assert_eq!(parsed.command, SlashCommand::Persona);
        assert_eq!(parsed.argument(), Some("MZ스님"));
    }

    #[test]
    fn multi_word_argument_is_joined() {
        let parsed = parse_slash_command("/p 불교 경전 선생님").unwrap();
        assert_eq!(parsed.command, SlashCommand::Persona);
        assert_eq!(parsed.argument(), Some("불교 경전 선생님"));
    }

    #[test]
    fn aliases_and_case() {
        assert_eq!(parse_slash_command("/Q").unwrap().command, SlashCommand::Bye);
        assert_eq!(parse_slash_command("/clear").unwrap().command, SlashCommand::Reset);
        assert_eq!(parse_slash_command("  /RESET ").unwrap().command, SlashCommand::Reset);
    }

    #[test]
    fn plain_text_and_unknown_commands_are_not_commands() {
        assert_eq!(parse_slash_command("what is karma?"), None);
        assert_eq!(parse_slash_command("/meditate"), None);
        assert_eq!(parse_slash_command("/"), None);
    }

    #[test]
    fn help_lists_every_command() {
        let help = get_help_text();
        for command in SlashCommand::iter() {
            assert!(help.contains(&format!("/{}", command.command())));
        }
    }
}
