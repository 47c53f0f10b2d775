// ABOUTME: Channel-agnostic conversation core: sessions, active pointers, and admission control
// ABOUTME: Provides the stores, traits, and orchestration any channel adapter builds on

pub mod admission;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod conversation_key;
pub mod events;
pub mod metrics;
pub mod paths;
pub mod pointer;
pub mod ratelimit;
pub mod session;
pub mod sqlite_store;

pub use admission::{AdmissionControl, Scope};
pub use commands::{
    classify, Classified, Command, CommandContext, CommandHandler, CommandInfo, CommandRegistry,
    CommandResult, CommandRouter,
};
pub use config::Config;
pub use conversation::{ActiveConversation, ActiveSource, ConversationService, SessionSummary};
pub use events::{RuntimeEvent, RuntimeEventType};
pub use pointer::PointerStore;
pub use ratelimit::{Clock, ManualClock, RateLimitResult, SystemClock, TokenBucket};
pub use session::{MemorySessionStore, Session, SessionMessage, SessionStore};
pub use sqlite_store::SqliteSessionStore;
