mod core;
mod history;
mod state;
mod switching;
mod title;


pub use state::{ChatEngine, EngineSettings, EngineSnapshot, EngineUpdate, TurnOutcome};
