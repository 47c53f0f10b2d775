// ABOUTME: Slash-command classification and the command-routing collaborator interface.
// ABOUTME: Includes a name-keyed registry that dispatches to per-command handlers.
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

pub const COMMAND_PREFIX: char = '/';

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name without the leading slash
    pub name: String,
    /// Whitespace-delimited positional arguments
    pub args: Vec<String>,
}

impl Command {
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }
}

/// Result of classifying inbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Command(Command),
    PlainText,
}

impl Classified {
    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Classified::Command(cmd) => Some(cmd),
            Classified::PlainText => None,
        }
    }
}

/// Classify text as a slash command or plain text.
///
/// `/name arg1 arg2` yields `Command { name, args }`. A bare `/` or a slash
/// followed by whitespace is plain text.
pub fn classify(text: &str) -> Classified {
    let Some(rest) = text.strip_prefix(COMMAND_PREFIX) else {
        return Classified::PlainText;
    };
    let mut tokens = rest.split_whitespace();
    match tokens.next() {
        Some(name) if !rest.starts_with(char::is_whitespace) => Classified::Command(Command {
            name: name.to_string(),
            args: tokens.map(str::to_string).collect(),
        }),
        _ => Classified::PlainText,
    }
}

// =============================================================================
// Router interface
// =============================================================================

/// Addressing handed to a command: which session and chat it was issued from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandContext {
    /// Composite `channel:conversationKey`
    pub session_id: String,
    pub channel_type: String,
    pub chat_id: String,
    pub session_chat_id: String,
    pub transport_chat_id: String,
    pub conversation_key: String,
}

impl CommandContext {
    /// Context for a channel where chat, transport, and conversation are one id.
    pub fn for_conversation(channel_type: &str, conversation_key: &str) -> Self {
        Self {
            session_id: crate::session::session_id(channel_type, conversation_key),
            channel_type: channel_type.to_string(),
            chat_id: conversation_key.to_string(),
            session_chat_id: conversation_key.to_string(),
            transport_chat_id: conversation_key.to_string(),
            conversation_key: conversation_key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub usage: String,
}

/// Executes slash commands on behalf of a channel.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    fn has_command(&self, name: &str) -> bool;

    /// Run a recognized command. An `Err` means execution itself failed; a
    /// command that ran and refused the request returns `CommandResult::failure`.
    async fn execute(
        &self,
        name: &str,
        args: &[String],
        context: &CommandContext,
    ) -> Result<CommandResult>;

    fn list_commands(&self) -> Vec<CommandInfo>;
}

// =============================================================================
// Registry
// =============================================================================

/// A single command implementation.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn info(&self) -> CommandInfo;

    async fn handle(&self, args: &[String], context: &CommandContext) -> Result<CommandResult>;
}

/// Router that dispatches by command name. Registering a name twice replaces
/// the earlier handler.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: BTreeMap<String, Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: CommandHandler + 'static,
    {
        let name = handler.info().name;
        self.handlers.insert(name, Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl CommandRouter for CommandRegistry {
    fn has_command(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    async fn execute(
        &self,
        name: &str,
        args: &[String],
        context: &CommandContext,
    ) -> Result<CommandResult> {
        let Some(handler) = self.handlers.get(name) else {
            return Ok(CommandResult::failure(format!("Unknown command: /{}", name)));
        };
        tracing::debug!(command = %name, session_id = %context.session_id, "Executing command");
        handler.handle(args, context).await
    }

    fn list_commands(&self) -> Vec<CommandInfo> {
        self.handlers.values().map(|h| h.info()).collect()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
