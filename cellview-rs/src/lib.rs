//! High-content screening pipeline: fetch plate images, segment cells,
//! quantify them and keep the results in the cellview store.

pub mod cellview;
pub mod config;
pub mod error;
pub mod features;
pub mod flatfield;
pub mod mask_cache;
pub mod model;
pub mod quality;
pub mod runner;
pub mod segment;
pub mod source;

pub use cellview::CellViewStore;
pub use config::RunConfig;
pub use runner::{CancelToken, RunAggregator, RunSummary};
