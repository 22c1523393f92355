use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::classifier::CACHE_MAX_AGE;
use crate::journal::Journal;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Hourly best-effort eviction of aged filing-cache rows. A failed sweep is
/// logged and retried on the next tick.
pub struct CacheSweeper {
    journal: Arc<dyn Journal>,
    interval: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
}

impl CacheSweeper {
    pub fn new(journal: Arc<dyn Journal>, shutdown: CancellationToken) -> Self {
        Self {
            journal,
            interval: SWEEP_INTERVAL,
            max_age: CACHE_MAX_AGE,
            shutdown,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately, consume it
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("cache sweeper stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        match self.journal.delete_cache_older_than(self.max_age).await {
                            Ok(deleted) if deleted > 0 => {
                                info!(deleted, "filing cache swept");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                error!(error = %err, "filing cache sweep failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{FilingCacheEntry, JournalError, QueryRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapJournal {
        cache: Mutex<HashMap<String, FilingCacheEntry>>,
    }

    #[async_trait]
    impl Journal for MapJournal {
        async fn append(&self, _record: &QueryRecord) -> Result<(), JournalError> {
            Ok(())
        }

        async fn get_cache(&self, domain: &str) -> Result<Option<FilingCacheEntry>, JournalError> {
            Ok(self.cache.lock().unwrap().get(domain).cloned())
        }

        async fn put_cache(
            &self,
            domain: &str,
            is_domestic: bool,
            api_response: &str,
        ) -> Result<(), JournalError> {
            self.cache.lock().unwrap().insert(
                domain.to_string(),
                FilingCacheEntry {
                    is_domestic,
                    api_response: api_response.to_string(),
                    updated_at: Utc::now(),
                },
            );
            Ok(())
        }

        async fn delete_cache_older_than(&self, max_age: Duration) -> Result<u64, JournalError> {
            let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap();
            let mut cache = self.cache.lock().unwrap();
            let before = cache.len();
            cache.retain(|_, entry| entry.updated_at >= cutoff);
            Ok((before - cache.len()) as u64)
        }
    }

    #[tokio::test]
    async fn sweeps_aged_entries_on_tick() {
        let journal = Arc::new(MapJournal::default());
        journal.put_cache("old.com", true, "{}").await.unwrap();
        journal
            .cache
            .lock()
            .unwrap()
            .get_mut("old.com")
            .unwrap()
            .updated_at = Utc::now() - chrono::Duration::hours(25);
        journal.put_cache("new.com", true, "{}").await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = CacheSweeper::new(journal.clone(), shutdown.clone())
            .with_interval(Duration::from_millis(20))
            .spawn();

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown.cancel();
        handle.await.expect("join sweeper");

        assert!(journal.get_cache("old.com").await.unwrap().is_none());
        assert!(journal.get_cache("new.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stops_promptly_on_shutdown() {
        let journal = Arc::new(MapJournal::default());
        let shutdown = CancellationToken::new();
        let handle = CacheSweeper::new(journal, shutdown.clone()).spawn();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper exits on cancel")
            .expect("join");
    }
}
