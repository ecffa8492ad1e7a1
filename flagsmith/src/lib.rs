//! # flagsmith
//!
//! Feature flag client for [Flagsmith](https://flagsmith.com) environments.
//!
//! ## Features
//!
//! - **Flags and traits**: anonymous and identity-scoped flags, trait reads
//!   and upserts.
//! - **Response cache**: disk-backed, size-bounded HTTP cache with a TTL,
//!   forced refresh and stale fallback when the api is unreachable.
//! - **Realtime updates**: a server-sent events subscription that invalidates
//!   the cache and refetches flags when the environment changes, with
//!   reconnect backoff.
//! - **Analytics**: flag evaluation counts flushed periodically.
//!
//! ## Modules
//!
//! - `api`: cached http client and typed endpoints.
//! - `client`: the [`Flagsmith`] client.
//! - `entities`: api request and response bodies.
//! - `events`: push-update transport and subscription.
//! - `config`: configuration (re-export of `flagsmith-config`).
//! - `cache`: response stores (re-export of `flagsmith-cache`).
pub mod analytics;
pub mod api;
pub mod client;
pub mod entities;
pub mod error;
pub mod events;
pub mod freshness;
pub mod observability;

pub use client::{FlagQuery, FlagQueryBuilder, Flagsmith, FlagsmithBuilder};
pub use entities::{
    Feature, Flag, FlagValue, Identity, IdentityFlagsAndTraits, Trait, TraitWithIdentity,
};
pub use error::FlagsmithError;
pub use events::SubscriptionState;
pub use flagsmith_cache as cache;
pub use flagsmith_config as config;

// re-export
pub use async_trait;
pub use reqwest;
pub use tracing;
