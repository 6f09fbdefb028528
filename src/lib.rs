// Re-export needed modules for testing
pub mod chat;
pub mod config;
pub mod error;
pub mod models;

// Re-export main types for convenience
pub use chat::client::ChatClient;
pub use chat::{ChatCore, ChatUpdate};
pub use error::{ChatError, ChatResult};
pub use models::*;
