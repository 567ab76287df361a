pub mod chat;
pub mod cursor;
pub mod message_store;
pub mod session;
pub mod target;

pub use chat::{ChatEngine, EngineSettings, EngineSnapshot, EngineUpdate, TurnOutcome};
pub use message_store::{LocalKey, Message, MessageStatus};
