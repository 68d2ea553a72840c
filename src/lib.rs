//! contained: browser-attached shells in ephemeral containers.
//!
//! Each browser connection gets one freshly created container, hardened by a
//! named security profile, with its TTY relayed over a WebSocket until either
//! side goes away. The container is then force-removed.

pub mod config;
pub mod engine;
pub mod error;
pub mod profiles;
pub mod server;
pub mod session;

pub use config::Config;
