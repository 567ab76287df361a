pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod types;
pub mod util;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, Backend};
pub use config::Config;
pub use error::{DecodeFault, EngineError, Fault};
pub use state::{ChatEngine, EngineSettings, EngineSnapshot, EngineUpdate, TurnOutcome};
