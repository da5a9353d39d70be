//! Fundgraph core library: ingests monthly mutual-fund portfolio disclosures
//! and maintains a temporal fund-to-instrument holdings graph in SQLite.
//!
//! The extraction stages (table merging, fund naming, row normalization,
//! asset classification, identity resolution) live in [`extract`]; the graph
//! store and its transactional writer live in [`store`].

pub mod config;
pub mod errors;
pub mod extract;
pub mod models;
pub mod store;

pub use config::PipelineConfig;
pub use errors::{FundGraphError, FundGraphResult};
pub use extract::pipeline::{BatchItem, IngestionPipeline, PreparedDocument};
pub use store::database::Database;
pub use store::writer::TemporalGraphWriter;
