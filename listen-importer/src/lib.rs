pub mod batch;
pub mod config;
pub mod dead_letter;
pub mod dedup;
pub mod error;
pub mod importer;
pub mod progress;
pub mod queue;
pub mod stats;
pub mod writer;
