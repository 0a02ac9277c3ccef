pub mod api;
pub mod chart;
pub mod classifier;
pub mod config;
pub mod csv_parser;
pub mod dataset;
pub mod db;
pub mod error;
pub mod files;
pub mod intent;
pub mod llm;
pub mod preprocess;
pub mod quality;
pub mod query_engine;
pub mod session;
pub mod sql_patch;
pub mod storage;
pub mod table_store;
pub mod upload;

pub use error::{AnalystError, Result};
pub use query_engine::{ChatQueryEngine, ChatResponse};
