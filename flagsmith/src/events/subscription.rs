//! Long-lived push-update subscription.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> (error | end) -> Connecting ...
//!                      any state --stop()--> Stopped
//! ```
//! Reconnects wait a capped, jittered exponential backoff which is reset
//! once a connection reaches `Streaming`.
use crate::{entities::FlagEvent, freshness::FreshnessTracker};
use super::sse::{EventSource, SseEvent};
use async_trait::async_trait;
use flagsmith_config::{ReconnectConfig, backoff::backoff::Backoff, http::reconnect_backoff};
use futures_util::StreamExt;
use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, trace, warn};

const ENVIRONMENT_UPDATED: &str = "environment_updated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Streaming,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionCommand {
    Stop,
}

/// Receiver of novel push updates.
#[async_trait]
pub trait FlagRefresher: Send + Sync {
    /// Drop cached responses so the refetch cannot be served stale data.
    async fn invalidate(&self);

    /// Refetch flags for the last used identity and publish them.
    async fn refresh(&self);
}

struct Running {
    control: broadcast::Sender<SubscriptionCommand>,
    handle: JoinHandle<()>,
}

pub struct UpdateSubscription {
    source: Arc<dyn EventSource>,
    freshness: Arc<FreshnessTracker>,
    refresher: Weak<dyn FlagRefresher>,
    reconnect: ReconnectConfig,
    state: Arc<watch::Sender<SubscriptionState>>,
    /// Bumped on every start and stop; only the loop of the current run may
    /// publish state.
    generation: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl UpdateSubscription {
    /// Created idle; call [`UpdateSubscription::start`] to connect.
    pub fn new(
        source: Arc<dyn EventSource>,
        freshness: Arc<FreshnessTracker>,
        refresher: Weak<dyn FlagRefresher>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        Self {
            source,
            freshness,
            refresher,
            reconnect,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawn the consume loop, replacing a running one. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let (control, control_rx) = broadcast::channel(4);
        let task = SubscriptionTask {
            generation: self.next_generation(),
            current: Arc::clone(&self.generation),
            source: Arc::clone(&self.source),
            freshness: Arc::clone(&self.freshness),
            refresher: self.refresher.clone(),
            reconnect: self.reconnect.clone(),
            state: Arc::clone(&self.state),
        };
        let previous = self.lock_running().replace(Running {
            control,
            handle: tokio::spawn(task.run(control_rx)),
        });
        if let Some(previous) = previous {
            let _ = previous.control.send(SubscriptionCommand::Stop);
        }
    }

    /// Signal the loop to stop without waiting for it.
    pub fn cancel(&self) {
        if let Some(running) = self.lock_running().take() {
            let _ = running.control.send(SubscriptionCommand::Stop);
            self.next_generation();
            self.state.send_replace(SubscriptionState::Stopped);
        }
    }

    /// Stop the loop and wait until it has dropped its connection.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        if let Some(running) = running {
            let _ = running.control.send(SubscriptionCommand::Stop);
            self.next_generation();
            let _ = running.handle.await;
            self.state.send_replace(SubscriptionState::Stopped);
        }
    }

    /// Retire the current run. Bumped under the watch lock so a retiring
    /// loop cannot publish between its generation check and its write.
    fn next_generation(&self) -> u64 {
        let mut generation = 0;
        self.state.send_if_modified(|_| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            false
        });
        generation
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct SubscriptionTask {
    generation: u64,
    current: Arc<AtomicU64>,
    source: Arc<dyn EventSource>,
    freshness: Arc<FreshnessTracker>,
    refresher: Weak<dyn FlagRefresher>,
    reconnect: ReconnectConfig,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl SubscriptionTask {
    fn publish(&self, state: SubscriptionState) {
        self.state.send_if_modified(|current| {
            if self.current.load(Ordering::SeqCst) != self.generation {
                return false;
            }
            *current = state;
            true
        });
    }

    #[instrument(name = "update_subscription", skip_all)]
    async fn run(self, mut control: broadcast::Receiver<SubscriptionCommand>) {
        let mut backoff = reconnect_backoff(&self.reconnect);

        'connect: loop {
            self.publish(SubscriptionState::Connecting);
            let connected = tokio::select! {
                _ = control.recv() => break 'connect,
                connected = self.source.connect() => connected,
            };

            match connected {
                Ok(mut events) => {
                    info!("streaming flag updates");
                    self.publish(SubscriptionState::Streaming);
                    backoff.reset();
                    loop {
                        let next = tokio::select! {
                            _ = control.recv() => break 'connect,
                            next = events.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                tokio::select! {
                                    _ = control.recv() => break 'connect,
                                    _ = self.handle_event(event) => {}
                                }
                            }
                            Some(Err(err)) => {
                                warn!(error = %err, "flag update stream failed");
                                break;
                            }
                            None => {
                                debug!("flag update stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(err) => warn!(error = %err, "failed to connect flag update stream"),
            }

            let wait = backoff
                .next_backoff()
                .unwrap_or(Duration::from_secs(self.reconnect.max_interval_secs));
            debug!(?wait, "reconnecting flag update stream");
            tokio::select! {
                _ = control.recv() => break 'connect,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.publish(SubscriptionState::Stopped);
        debug!("flag update subscription stopped");
    }

    async fn handle_event(&self, event: SseEvent) {
        match event.event.as_deref() {
            None | Some("message") | Some(ENVIRONMENT_UPDATED) => {}
            Some(other) => {
                trace!(event = other, "ignoring event type");
                return;
            }
        }
        if event.data.trim().is_empty() {
            return;
        }

        let update: FlagEvent = match serde_json::from_str(&event.data) {
            Ok(update) => update,
            Err(err) => {
                warn!(?err, data = %event.data, "dropping malformed flag event");
                return;
            }
        };

        let known = self.freshness.get();
        if update.updated_at <= known {
            trace!(updated_at = update.updated_at, known, "flag event is not newer");
            return;
        }
        let Some(refresher) = self.refresher.upgrade() else {
            return;
        };

        info!(updated_at = update.updated_at, known, "flags changed upstream");
        refresher.invalidate().await;
        self.freshness.observe(update.updated_at);
        refresher.refresh().await;
    }
}
