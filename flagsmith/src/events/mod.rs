//! Push updates: SSE transport and the reconnecting subscription.
mod sse;
mod subscription;

pub use sse::{EventSource, EventStream, HttpEventSource, SseEvent, SseParser};
pub use subscription::{
    FlagRefresher, SubscriptionCommand, SubscriptionState, UpdateSubscription,
};
