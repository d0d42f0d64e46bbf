pub mod estimator;
pub mod locks;
pub mod optimizer;
pub mod summary;

pub use estimator::estimate_tokens;
pub use locks::ConversationLocks;
pub use optimizer::{CompressionOutcome, Optimizer, SkipReason, select_within_budget};
