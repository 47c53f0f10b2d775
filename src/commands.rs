// ABOUTME: Built-in slash commands backed by the conversation service.
// ABOUTME: /help, /status, /new, /reset, /compact, and /sessions for any channel.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use parley_core::commands::{CommandContext, CommandHandler, CommandInfo, CommandRegistry, CommandResult};
use parley_core::conversation::{ConversationService, DEFAULT_KEEP_LAST};

const MAX_COMPACT_KEEP: usize = 100;
const SESSIONS_LISTED: usize = 10;

fn info(name: &str, description: &str, usage: &str) -> CommandInfo {
    CommandInfo {
        name: name.to_string(),
        description: description.to_string(),
        usage: usage.to_string(),
    }
}

/// Registry with every built-in command registered.
pub fn builtin_registry(conversations: ConversationService) -> CommandRegistry {
    let conversations = Arc::new(conversations);
    let mut registry = CommandRegistry::new();
    registry.register(StatusCommand(Arc::clone(&conversations)));
    registry.register(NewCommand);
    registry.register(ResetCommand(Arc::clone(&conversations)));
    registry.register(CompactCommand(Arc::clone(&conversations)));
    registry.register(SessionsCommand(conversations));

    let mut listing = parley_core::commands::CommandRouter::list_commands(&registry);
    listing.push(HelpCommand::info_static());
    listing.sort_by(|a, b| a.name.cmp(&b.name));
    registry.register(HelpCommand(listing));
    registry
}

// =============================================================================
// Handlers
// =============================================================================

struct HelpCommand(Vec<CommandInfo>);

impl HelpCommand {
    fn info_static() -> CommandInfo {
        info("help", "Show available commands", "/help")
    }
}

#[async_trait]
impl CommandHandler for HelpCommand {
    fn info(&self) -> CommandInfo {
        Self::info_static()
    }

    async fn handle(&self, _args: &[String], _context: &CommandContext) -> Result<CommandResult> {
        let mut text = String::from("Available commands:\n");
        for command in &self.0 {
            text.push_str(&format!("{} - {}\n", command.usage, command.description));
        }
        Ok(CommandResult::success(text.trim_end()))
    }
}

struct StatusCommand(Arc<ConversationService>);

#[async_trait]
impl CommandHandler for StatusCommand {
    fn info(&self) -> CommandInfo {
        info("status", "Show session status", "/status")
    }

    async fn handle(&self, _args: &[String], context: &CommandContext) -> Result<CommandResult> {
        let count = self
            .0
            .store()
            .get(&context.session_id)?
            .map(|s| s.messages.len())
            .unwrap_or(0);
        Ok(CommandResult::success(format!(
            "**Session status**\n\nSession: {}\nMessages: {}",
            context.session_id, count
        )))
    }
}

/// Clients create the new conversation themselves before sending; this only acknowledges.
struct NewCommand;

#[async_trait]
impl CommandHandler for NewCommand {
    fn info(&self) -> CommandInfo {
        info("new", "Start a new conversation", "/new")
    }

    async fn handle(&self, _args: &[String], _context: &CommandContext) -> Result<CommandResult> {
        Ok(CommandResult::success("New conversation started."))
    }
}

struct ResetCommand(Arc<ConversationService>);

#[async_trait]
impl CommandHandler for ResetCommand {
    fn info(&self) -> CommandInfo {
        info("reset", "Reset conversation", "/reset")
    }

    async fn handle(&self, _args: &[String], context: &CommandContext) -> Result<CommandResult> {
        self.0.clear(&context.session_id)?;
        Ok(CommandResult::success("Conversation reset."))
    }
}

struct CompactCommand(Arc<ConversationService>);

#[async_trait]
impl CommandHandler for CompactCommand {
    fn info(&self) -> CommandInfo {
        info("compact", "Compact conversation history", "/compact [keep]")
    }

    async fn handle(&self, args: &[String], context: &CommandContext) -> Result<CommandResult> {
        // Unparseable counts fall back to the default
        let keep = args
            .first()
            .and_then(|a| a.parse::<usize>().ok())
            .map(|n| n.clamp(1, MAX_COMPACT_KEEP))
            .unwrap_or(DEFAULT_KEEP_LAST);

        match self.0.compact(&context.session_id, Some(keep))? {
            Some(removed) if removed > 0 => Ok(CommandResult::success(format!(
                "Removed {} messages, kept the last {}.",
                removed, keep
            ))),
            Some(_) | None => {
                let count = self
                    .0
                    .store()
                    .get(&context.session_id)?
                    .map(|s| s.messages.len())
                    .unwrap_or(0);
                Ok(CommandResult::success(format!(
                    "Nothing to compact ({} messages).",
                    count
                )))
            }
        }
    }
}

struct SessionsCommand(Arc<ConversationService>);

#[async_trait]
impl CommandHandler for SessionsCommand {
    fn info(&self) -> CommandInfo {
        info("sessions", "List recent conversations", "/sessions")
    }

    async fn handle(&self, _args: &[String], context: &CommandContext) -> Result<CommandResult> {
        let recent = self
            .0
            .list_recent(&context.channel_type, None, None, SESSIONS_LISTED)?;
        if recent.is_empty() {
            return Ok(CommandResult::success("No conversations yet."));
        }
        let mut text = String::from("Recent conversations:\n");
        for summary in recent {
            let marker = if summary.id == context.session_id { "*" } else { "-" };
            text.push_str(&format!(
                "{} {} ({} messages) `{}`\n",
                marker, summary.title, summary.message_count, summary.conversation_key
            ));
        }
        Ok(CommandResult::success(text.trim_end()))
    }
}
