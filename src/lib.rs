pub mod config;
pub mod error;
pub mod model;
pub mod ledger;
pub mod graph;
pub mod resolver;
pub mod conflict;
pub mod analyzer;
pub mod store;
pub mod engine;

pub use config::Config;
pub use engine::{BatchReport, ConsolidationEngine, EngineStats};
pub use error::{GraphweldError, Result};
pub use model::Mention;
