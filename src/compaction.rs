#[cfg(test)]
#[path = "compaction_test.rs"]
mod tests;

use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::context::{CompressionOutcome, Optimizer, SkipReason};
use crate::error::{BudgetError, Result};

#[derive(Debug, Default)]
pub struct CompactionReport {
    /// Conversation id and number of messages folded into its summary.
    pub compressed: Vec<(String, usize)>,
    pub skipped: Vec<(String, SkipReason)>,
    pub failed: Vec<(String, BudgetError)>,
}

impl CompactionReport {
    pub fn total(&self) -> usize {
        self.compressed.len() + self.skipped.len() + self.failed.len()
    }
}

/// Runs one compaction pass over every stored conversation. Conversations
/// are processed concurrently; a failure in one is recorded in the report
/// and does not stop the others. With `force` the budget check is skipped.
pub async fn compact_all(optimizer: &Optimizer, force: bool) -> Result<CompactionReport> {
    let conversations = optimizer.conversations().await?;

    let results = join_all(conversations.iter().map(|conversation| async move {
        let res = if force {
            optimizer.compress_old_messages(conversation.id()).await
        } else {
            optimizer.compress_if_needed(conversation.id()).await
        };
        (conversation.id().to_string(), res)
    }))
    .await;

    let mut report = CompactionReport::default();
    for (id, res) in results {
        match res {
            Ok(CompressionOutcome::Compressed { removed, .. }) => {
                report.compressed.push((id, removed))
            }
            Ok(CompressionOutcome::Skipped(reason)) => report.skipped.push((id, reason)),
            Err(err) => {
                log::warn!("Failed to compact conversation {}: {}", id, err);
                report.failed.push((id, err));
            }
        }
    }
    Ok(report)
}

/// Calls [`compact_all`] every `interval` until `cancel_token` is cancelled.
/// The first pass runs immediately.
pub async fn run_periodic(
    optimizer: &Optimizer,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::debug!("Compaction loop cancelled");
                return;
            }

            _ = ticker.tick() => {
                match compact_all(optimizer, false).await {
                    Ok(report) => log::info!(
                        "Compaction pass: {} compressed, {} skipped, {} failed",
                        report.compressed.len(),
                        report.skipped.len(),
                        report.failed.len()
                    ),
                    Err(err) => log::error!("Compaction pass failed: {}", err),
                }
            }
        }
    }
}
