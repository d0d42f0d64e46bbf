pub mod cli;
pub mod compaction;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod storage;

pub use error::{BudgetError, Result};
