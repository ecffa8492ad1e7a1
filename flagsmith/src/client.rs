//! [`Flagsmith`]: the public client tying the cached api, push updates and
//! analytics together.
use crate::{
    FlagsmithError,
    analytics::FlagAnalytics,
    api::{CachingHttpClient, FlagsmithApi, RequestOptions},
    entities::{
        Flag, FlagValue, Identity, IdentityAndTraits, IdentityFlagsAndTraits, Trait,
        TraitWithIdentity,
    },
    events::{EventSource, FlagRefresher, HttpEventSource, SubscriptionState, UpdateSubscription},
    freshness::FreshnessTracker,
};
use async_trait::async_trait;
use derive_builder::Builder;
use flagsmith_cache::{FileCacheStore, SharedHttpCache};
use flagsmith_config::{
    FlagsmithConfig,
    http::{HttpClientParams, build_http_client},
};
use std::sync::{
    Arc, Mutex, MutexGuard, Weak,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Which flags to fetch.
///
/// Traits without an identity are rejected. Traits with an identity are an
/// upsert and never served from cache.
#[derive(Builder, Debug, Clone, Default, PartialEq)]
#[builder(public, setter(into), default)]
pub struct FlagQuery {
    #[builder(setter(into, strip_option))]
    pub identity: Option<String>,
    #[builder(setter(into, strip_option))]
    pub traits: Option<Vec<Trait>>,
    pub transient: bool,
    pub force_refresh: bool,
}

impl FlagQuery {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Self::default()
        }
    }

    fn for_optional_identity(identity: Option<&str>) -> Self {
        Self {
            identity: identity.map(str::to_string),
            ..Self::default()
        }
    }
}

/// Constructs a [`Flagsmith`] client. Must be built inside a tokio runtime
/// when analytics or realtime updates are enabled.
pub struct FlagsmithBuilder {
    config: FlagsmithConfig,
    default_flags: Vec<Flag>,
    cache_store: Option<SharedHttpCache>,
    event_source: Option<Arc<dyn EventSource>>,
}

impl FlagsmithBuilder {
    pub fn new(config: FlagsmithConfig) -> Self {
        Self {
            config,
            default_flags: Vec::new(),
            cache_store: None,
            event_source: None,
        }
    }

    /// Flags returned when the anonymous flag fetch fails.
    pub fn default_flags(mut self, flags: Vec<Flag>) -> Self {
        self.default_flags = flags;
        self
    }

    /// Custom response store. Enables caching regardless of
    /// `cache.enable_cache`.
    pub fn cache_store(mut self, store: SharedHttpCache) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Custom push-update transport, used when realtime updates are enabled.
    pub fn event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.event_source = Some(source);
        self
    }

    pub fn build(self) -> Result<Flagsmith, FlagsmithError> {
        let config = self.config;
        config.validate()?;

        let needs_runtime = config.enable_analytics || config.enable_realtime_updates;
        if needs_runtime && tokio::runtime::Handle::try_current().is_err() {
            return Err(FlagsmithError::Configuration(
                "analytics and realtime updates require a tokio runtime".into(),
            ));
        }

        let cache: Option<SharedHttpCache> = match self.cache_store {
            Some(store) => Some(store),
            None if config.cache.enable_cache => {
                let store = FileCacheStore::new(
                    &config.cache.cache_directory,
                    config.cache.cache_size_bytes,
                );
                std::fs::create_dir_all(store.dir()).map_err(|e| {
                    FlagsmithError::Configuration(format!(
                        "cache directory {} is not usable: {e}",
                        store.dir().display()
                    ))
                })?;
                Some(Arc::new(store))
            }
            None => None,
        };

        let http = build_http_client(HttpClientParams::from_config(&config))?;
        let freshness = Arc::new(FreshnessTracker::new());
        let api = Arc::new(FlagsmithApi::new(CachingHttpClient::new(
            &config,
            http,
            cache,
            Arc::clone(&freshness),
        )?));

        let analytics = config.enable_analytics.then(|| {
            Arc::new(FlagAnalytics::new(
                Arc::clone(&api),
                config.analytics_flush_period(),
            ))
        });

        let event_source: Option<Arc<dyn EventSource>> = if config.enable_realtime_updates {
            match self.event_source {
                Some(source) => Some(source),
                None => Some(Arc::new(HttpEventSource::new(&config)?)),
            }
        } else {
            None
        };

        let (current, _) = watch::channel(Vec::new());
        let inner = Arc::new_cyclic(|weak: &Weak<FlagsmithInner>| {
            let refresher: Weak<dyn FlagRefresher> = weak.clone();
            let subscription = event_source.map(|source| {
                UpdateSubscription::new(
                    source,
                    Arc::clone(&freshness),
                    refresher,
                    config.reconnect.clone(),
                )
            });
            FlagsmithInner {
                config,
                api,
                default_flags: self.default_flags,
                analytics,
                subscription,
                freshness,
                current,
                last_used_identity: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }
        });

        if let Some(subscription) = &inner.subscription {
            subscription.start();
        }
        if let Some(analytics) = &inner.analytics {
            analytics.start();
        }
        info!(
            realtime = inner.subscription.is_some(),
            analytics = inner.analytics.is_some(),
            cache = inner.api.client().cache().is_some(),
            "flagsmith client ready"
        );
        Ok(Flagsmith { inner })
    }
}

struct FlagsmithInner {
    config: FlagsmithConfig,
    api: Arc<FlagsmithApi>,
    default_flags: Vec<Flag>,
    analytics: Option<Arc<FlagAnalytics>>,
    subscription: Option<UpdateSubscription>,
    freshness: Arc<FreshnessTracker>,
    current: watch::Sender<Vec<Flag>>,
    last_used_identity: Mutex<Option<String>>,
    shut_down: AtomicBool,
}

impl FlagsmithInner {
    fn options(&self, force_refresh: bool) -> RequestOptions {
        RequestOptions {
            force_refresh,
            accept_stale: self.config.cache.accept_stale_on_error,
        }
    }

    fn lock_identity(&self) -> MutexGuard<'_, Option<String>> {
        self.last_used_identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn remember_identity(&self, identity: Option<&str>) {
        *self.lock_identity() = identity.map(str::to_string);
    }

    fn publish(&self, flags: &[Flag]) {
        self.current.send_replace(flags.to_vec());
    }

    async fn get_feature_flags(&self, query: FlagQuery) -> Result<Vec<Flag>, FlagsmithError> {
        self.remember_identity(query.identity.as_deref());
        let options = self.options(query.force_refresh);

        match (query.identity, query.traits) {
            (Some(identifier), Some(traits)) => {
                let body = IdentityAndTraits {
                    identifier,
                    traits,
                    transient: Some(query.transient),
                };
                let flags = self.api.post_traits(&body).await?.flags;
                self.publish(&flags);
                Ok(flags)
            }
            (Some(identifier), None) => {
                let flags = self
                    .api
                    .get_identity_flags_and_traits(&identifier, query.transient, options)
                    .await?
                    .flags;
                self.publish(&flags);
                Ok(flags)
            }
            (None, Some(_)) => Err(FlagsmithError::InvalidArgument(
                "traits require an identity".into(),
            )),
            (None, None) => match self.api.get_flags(options).await {
                Ok(flags) => {
                    self.publish(&flags);
                    Ok(flags)
                }
                Err(err) => {
                    warn!(error = %err, "flag fetch failed, using default flags");
                    self.publish(&self.default_flags);
                    Ok(self.default_flags.clone())
                }
            },
        }
    }

    async fn get_identity(
        &self,
        identity: &str,
        transient: bool,
    ) -> Result<IdentityFlagsAndTraits, FlagsmithError> {
        self.remember_identity(Some(identity));
        self.api
            .get_identity_flags_and_traits(identity, transient, self.options(false))
            .await
    }

    async fn post_traits(
        &self,
        traits: Vec<Trait>,
        identity: &str,
    ) -> Result<Vec<TraitWithIdentity>, FlagsmithError> {
        let body = IdentityAndTraits {
            identifier: identity.to_string(),
            traits,
            transient: None,
        };
        let response = self.api.post_traits(&body).await?;
        Ok(response
            .traits
            .into_iter()
            .map(|t| TraitWithIdentity {
                key: t.key,
                value: t.value,
                identity: Identity {
                    identifier: identity.to_string(),
                },
            })
            .collect())
    }

    async fn close(&self) {
        if let Some(subscription) = &self.subscription {
            subscription.stop().await;
        }
        if let Some(analytics) = &self.analytics {
            analytics.stop().await;
        }
    }
}

#[async_trait]
impl FlagRefresher for FlagsmithInner {
    async fn invalidate(&self) {
        self.api.client().invalidate_cache().await;
    }

    async fn refresh(&self) {
        let identity = self.lock_identity().clone();
        debug!(identity = ?identity, "refetching flags after push update");
        let query = FlagQuery {
            identity,
            ..FlagQuery::default()
        };
        if let Err(err) = self.get_feature_flags(query).await {
            warn!(error = %err, "failed to refetch flags after push update");
        }
    }
}

impl Drop for FlagsmithInner {
    fn drop(&mut self) {
        if let Some(analytics) = &self.analytics {
            analytics.cancel();
        }
    }
}

/// Feature flag client for one Flagsmith environment. Cheap to clone.
///
/// ```no_run
/// # async fn run() -> Result<(), flagsmith::FlagsmithError> {
/// use flagsmith::{Flagsmith, FlagQuery, config::FlagsmithConfigBuilder};
///
/// let config = FlagsmithConfigBuilder::default()
///     .environment_key("ser.abc")
///     .build()
///     .unwrap();
/// let flagsmith = Flagsmith::builder(config).build()?;
/// let flags = flagsmith.get_feature_flags(FlagQuery::for_identity("bob")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Flagsmith {
    inner: Arc<FlagsmithInner>,
}

impl Flagsmith {
    pub fn builder(config: FlagsmithConfig) -> FlagsmithBuilder {
        FlagsmithBuilder::new(config)
    }

    pub fn new(config: FlagsmithConfig) -> Result<Self, FlagsmithError> {
        FlagsmithBuilder::new(config).build()
    }

    pub fn config(&self) -> &FlagsmithConfig {
        &self.inner.config
    }

    /// Fetch flags and publish them to [`Flagsmith::flag_updates`].
    ///
    /// The anonymous fetch never fails: the default flags stand in for any
    /// error.
    pub async fn get_feature_flags(&self, query: FlagQuery) -> Result<Vec<Flag>, FlagsmithError> {
        self.inner.get_feature_flags(query).await
    }

    /// Enabled flag named `feature`, if any. Counts towards analytics.
    pub async fn get_feature_flag(
        &self,
        feature: &str,
        identity: Option<&str>,
    ) -> Result<Option<Flag>, FlagsmithError> {
        let flags = self
            .inner
            .get_feature_flags(FlagQuery::for_optional_identity(identity))
            .await?;
        if let Some(analytics) = &self.inner.analytics {
            analytics.track_event(feature);
        }
        Ok(flags
            .into_iter()
            .find(|flag| flag.enabled && flag.name() == feature))
    }

    pub async fn has_feature_flag(
        &self,
        feature: &str,
        identity: Option<&str>,
    ) -> Result<bool, FlagsmithError> {
        Ok(self.get_feature_flag(feature, identity).await?.is_some())
    }

    pub async fn get_value_for_feature(
        &self,
        feature: &str,
        identity: Option<&str>,
    ) -> Result<Option<FlagValue>, FlagsmithError> {
        Ok(self
            .get_feature_flag(feature, identity)
            .await?
            .and_then(|flag| flag.feature_state_value))
    }

    pub async fn get_trait(
        &self,
        key: &str,
        identity: &str,
    ) -> Result<Option<Trait>, FlagsmithError> {
        let traits = self.get_traits(identity).await?;
        Ok(traits.into_iter().find(|t| t.key == key))
    }

    pub async fn get_traits(&self, identity: &str) -> Result<Vec<Trait>, FlagsmithError> {
        Ok(self.inner.get_identity(identity, false).await?.traits)
    }

    /// Upsert one trait. Returns the trait as stored by the server.
    pub async fn set_trait(
        &self,
        value: Trait,
        identity: &str,
    ) -> Result<TraitWithIdentity, FlagsmithError> {
        let key = value.key.clone();
        let fallback = TraitWithIdentity {
            key: value.key.clone(),
            value: value.value.clone(),
            identity: Identity {
                identifier: identity.to_string(),
            },
        };
        let stored = self.inner.post_traits(vec![value], identity).await?;
        Ok(stored
            .into_iter()
            .find(|t| t.key == key)
            .unwrap_or(fallback))
    }

    pub async fn set_traits(
        &self,
        traits: Vec<Trait>,
        identity: &str,
    ) -> Result<Vec<TraitWithIdentity>, FlagsmithError> {
        self.inner.post_traits(traits, identity).await
    }

    pub async fn get_identity(
        &self,
        identity: &str,
        transient: bool,
    ) -> Result<IdentityFlagsAndTraits, FlagsmithError> {
        self.inner.get_identity(identity, transient).await
    }

    /// Drop all cached responses. Never fails.
    pub async fn clear_cache(&self) {
        self.inner.api.client().invalidate_cache().await;
    }

    /// Every flag list published by a fetch or a push-triggered refetch.
    pub fn flag_updates(&self) -> watch::Receiver<Vec<Flag>> {
        self.inner.current.subscribe()
    }

    pub fn current_flags(&self) -> Vec<Flag> {
        self.inner.current.borrow().clone()
    }

    pub fn last_used_identity(&self) -> Option<String> {
        self.inner.lock_identity().clone()
    }

    /// Server-reported update time of the newest data seen, unix seconds.
    pub fn last_flag_fetch_time(&self) -> f64 {
        self.inner.freshness.get()
    }

    pub fn subscription_state(&self) -> Option<SubscriptionState> {
        self.inner.subscription.as_ref().map(UpdateSubscription::state)
    }

    pub fn subscription_state_changes(&self) -> Option<watch::Receiver<SubscriptionState>> {
        self.inner
            .subscription
            .as_ref()
            .map(UpdateSubscription::state_changes)
    }

    /// Re-subscribe to push updates (and resume analytics flushing) after
    /// [`Flagsmith::close`].
    pub fn restart_realtime_updates(&self) -> Result<(), FlagsmithError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(FlagsmithError::InvalidState("client was shut down".into()));
        }
        let Some(subscription) = &self.inner.subscription else {
            return Err(FlagsmithError::InvalidState(
                "realtime updates were not enabled".into(),
            ));
        };
        subscription.start();
        if let Some(analytics) = &self.inner.analytics {
            analytics.start();
        }
        Ok(())
    }

    /// Stop push updates and analytics flushing. Cached data is kept.
    /// Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// [`Flagsmith::close`] for good: updates can no longer be restarted.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.close().await;
    }
}
