//! Background tasks for the Provider.

use crate::transaction::TransactionEngine;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Starts the finished-transaction pruning task.
///
/// Runs indefinitely, dropping transactions that finished more than
/// `retention_seconds` ago.
pub async fn start_pruning_task(engine: Arc<TransactionEngine>, retention_seconds: u64) {
    if retention_seconds == 0 {
        tracing::warn!("transaction pruning disabled (retention=0)");
        return;
    }

    let interval_seconds = (retention_seconds / 2).clamp(1, 60);
    let interval = Duration::from_secs(interval_seconds);
    let retention = crate::seconds(retention_seconds);

    tracing::info!(
        retention_seconds,
        interval_seconds,
        "starting transaction pruning task"
    );

    loop {
        sleep(interval).await;

        let pruned = engine.prune_finished(retention);
        if pruned > 0 {
            tracing::info!(count = pruned, "pruned finished transactions");
        }
    }
}
