//! Runner (spec §4.5): owns the daemon's tokio tasks -- a tight consume
//! loop with exponential backoff, and a periodic maintenance loop that
//! refreshes lag, compacts the outbox, and prunes stale indices. Grounded on
//! the teacher's `main.rs` pattern of spawning long-lived tasks that share a
//! single `Arc<DB>`-backed service.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::consumer::Consumer;
use crate::metrics::COMPACTIONS_TOTAL;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct RunnerConfig {
    pub compaction_interval: Duration,
    pub compaction_safety_margin: u64,
    pub triedb_state_history: u64,
    pub lag_refresh_interval: Duration,
}

pub struct Runner {
    consumer: Arc<Mutex<Consumer>>,
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(consumer: Consumer, config: RunnerConfig) -> Self {
        Self { consumer: Arc::new(Mutex::new(consumer)), config, cancel: CancellationToken::new() }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn consumer_handle(&self) -> Arc<Mutex<Consumer>> {
        self.consumer.clone()
    }

    /// Spawns the consume loop and maintenance loop, returning their join
    /// handles so the caller (`main.rs`) can await both and exit on the
    /// first fatal error (spec §4.5 "terminates the daemon").
    pub fn spawn(self) -> (tokio::task::JoinHandle<Result<(), crate::error::ConsumerError>>, tokio::task::JoinHandle<()>) {
        let consume_consumer = self.consumer.clone();
        let consume_cancel = self.cancel.clone();
        let consume_handle = tokio::spawn(async move { Self::consume_loop(consume_consumer, consume_cancel).await });

        let maintenance_consumer = self.consumer.clone();
        let maintenance_cancel = self.cancel.clone();
        let maintenance_config = RunnerConfig {
            compaction_interval: self.config.compaction_interval,
            compaction_safety_margin: self.config.compaction_safety_margin,
            triedb_state_history: self.config.triedb_state_history,
            lag_refresh_interval: self.config.lag_refresh_interval,
        };
        let maintenance_handle =
            tokio::spawn(async move { Self::maintenance_loop(maintenance_consumer, maintenance_config, maintenance_cancel).await });

        (consume_handle, maintenance_handle)
    }

    /// Spec §4.5 consume loop: call `ConsumeNext` in a tight loop; back off
    /// exponentially on transient errors (resetting on success), return
    /// immediately on a fatal error, and sleep briefly on idle/no-event.
    async fn consume_loop(consumer: Arc<Mutex<Consumer>>, cancel: CancellationToken) -> Result<(), crate::error::ConsumerError> {
        let mut backoff = BACKOFF_INITIAL;
        let mut last_lag_refresh = tokio::time::Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if last_lag_refresh.elapsed() >= Duration::from_secs(30) {
                let mut guard = consumer.lock().await;
                if let Err(error) = guard.refresh_lag().await {
                    tracing::warn!(%error, "failed to refresh outbox lag");
                }
                last_lag_refresh = tokio::time::Instant::now();
            }

            let result = {
                let mut guard = consumer.lock().await;
                guard.consume_next().await
            };

            match result {
                Ok(()) => {
                    backoff = BACKOFF_INITIAL;
                }
                Err(error) if error.is_fatal() => {
                    tracing::error!(%error, "fatal consumer error, terminating");
                    return Err(error);
                }
                Err(error) if error.is_idle() => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(error) => {
                    tracing::warn!(%error, backoff_secs = backoff.as_secs(), "transient consumer error, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Spec §4.5 maintenance loop: compacts the outbox below a safety-margined
    /// floor and prunes stale block-root/canonical and slot-index entries
    /// below the retained trie history window.
    async fn maintenance_loop(consumer: Arc<Mutex<Consumer>>, config: RunnerConfig, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(config.compaction_interval) => {}
                _ = cancel.cancelled() => return,
            }

            let mut guard = consumer.lock().await;
            let applied_seq = guard.applied_seq();
            let applied_block = guard.applied_block();

            let safe_seq = applied_seq.saturating_sub(config.compaction_safety_margin);
            match guard.compact_outbox_below(safe_seq).await {
                Ok((deleted, achieved)) => {
                    COMPACTIONS_TOTAL.with_label_values(&["ok"]).inc();
                    tracing::debug!(deleted, achieved, "outbox compaction completed");
                }
                Err(error) => {
                    COMPACTIONS_TOTAL.with_label_values(&["error"]).inc();
                    tracing::warn!(%error, "outbox compaction failed");
                }
            }

            let floor_block = applied_block.saturating_sub(config.triedb_state_history);
            if let Err(error) = guard.prune_stale_indices_below(floor_block) {
                tracing::warn!(%error, "stale index pruning failed");
            }
            if let Err(error) = guard.prune_slot_index_if_safe(applied_block, config.triedb_state_history) {
                tracing::warn!(%error, "slot index pruning failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_max() {
        let mut backoff = BACKOFF_INITIAL;
        for _ in 0..10 {
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        assert_eq!(backoff, BACKOFF_MAX);
    }
}
