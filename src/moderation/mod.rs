pub mod commands;
pub mod directory;
pub mod engine;
pub mod journal;
pub mod store;

pub use engine::ModerationEngine;
