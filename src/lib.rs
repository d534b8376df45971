pub mod config;
pub mod consolidate;
pub mod db;
pub mod error;
pub mod import;
pub mod models;
pub mod report;
pub mod service;
pub mod store;
pub mod validate;
pub mod visibility;

pub use error::{EngineError, Result, ValidationError};
pub use service::IndicatorService;
pub use store::{Backend, MemoryBackend, RecordStore};
