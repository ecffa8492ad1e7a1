//! Flag evaluation counting, flushed periodically to `analytics/flags/`.
use crate::{FlagsmithError, api::FlagsmithApi};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, instrument, warn};

pub struct FlagAnalytics {
    api: Arc<FlagsmithApi>,
    flush_period: Duration,
    counts: Mutex<HashMap<String, u64>>,
    flusher: Mutex<Option<(broadcast::Sender<()>, JoinHandle<()>)>>,
}

impl FlagAnalytics {
    pub fn new(api: Arc<FlagsmithApi>, flush_period: Duration) -> Self {
        Self {
            api,
            flush_period,
            counts: Mutex::new(HashMap::new()),
            flusher: Mutex::new(None),
        }
    }

    pub fn track_event(&self, feature: &str) {
        *self.lock_counts().entry(feature.to_string()).or_insert(0) += 1;
    }

    pub fn counts(&self) -> HashMap<String, u64> {
        self.lock_counts().clone()
    }

    /// Post the current counts. Posted amounts are subtracted on success so
    /// evaluations tracked during the request are kept for the next flush.
    pub async fn flush(&self) -> Result<(), FlagsmithError> {
        let snapshot = self.counts();
        if snapshot.is_empty() {
            return Ok(());
        }
        self.api.post_analytics(&snapshot).await?;

        let mut counts = self.lock_counts();
        for (feature, sent) in snapshot {
            if let Some(count) = counts.get_mut(&feature) {
                *count = count.saturating_sub(sent);
                if *count == 0 {
                    counts.remove(&feature);
                }
            }
        }
        Ok(())
    }

    /// Spawn the periodic flush loop, replacing a running one.
    pub fn start(self: &Arc<Self>) {
        let (stop, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(self).flush_loop(stop_rx));
        if let Some((previous, _)) = self.lock_flusher().replace((stop, handle)) {
            let _ = previous.send(());
        }
    }

    pub fn cancel(&self) {
        if let Some((stop, _)) = self.lock_flusher().take() {
            let _ = stop.send(());
        }
    }

    pub async fn stop(&self) {
        let flusher = self.lock_flusher().take();
        if let Some((stop, handle)) = flusher {
            let _ = stop.send(());
            let _ = handle.await;
        }
    }

    #[instrument(name = "analytics_flush", skip_all)]
    async fn flush_loop(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.flush_period);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.flush().await {
                        warn!(error = %err, "failed to flush analytics");
                    }
                }
            }
        }
        debug!("analytics flush loop stopped");
    }

    fn lock_counts(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_flusher(&self) -> MutexGuard<'_, Option<(broadcast::Sender<()>, JoinHandle<()>)>> {
        self.flusher.lock().unwrap_or_else(|e| e.into_inner())
    }
}
