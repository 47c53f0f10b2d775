// ABOUTME: Root library module exposing the gateway, auth, bus, and server modules
// ABOUTME: Platform-agnostic stores and admission control are re-exported from parley-core

pub mod auth;
pub mod bus;
pub mod commands;
pub mod gateway;
pub mod server;

// Re-export platform-agnostic modules from parley-core
pub use parley_core::admission;
pub use parley_core::config;
pub use parley_core::conversation;
pub use parley_core::events;
pub use parley_core::metrics;
pub use parley_core::paths;
pub use parley_core::pointer;
pub use parley_core::session;
