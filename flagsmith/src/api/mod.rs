//! Typed endpoints of the Flagsmith REST api on top of [`CachingHttpClient`].
mod caching;

pub use caching::{
    ApiResponse, CachingHttpClient, RequestDescriptor, RequestOptions, ResponseSource,
    UPDATED_AT_HEADER,
};

use crate::{
    FlagsmithError,
    entities::{Flag, IdentityAndTraits, IdentityFlagsAndTraits},
};
use std::collections::HashMap;

const FLAGS_PATH: &str = "flags/";
const IDENTITIES_PATH: &str = "identities/";
const ANALYTICS_PATH: &str = "analytics/flags/";

pub struct FlagsmithApi {
    client: CachingHttpClient,
}

impl FlagsmithApi {
    pub fn new(client: CachingHttpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &CachingHttpClient {
        &self.client
    }

    /// `GET flags/`: the environment's flags without identity overrides.
    pub async fn get_flags(&self, options: RequestOptions) -> Result<Vec<Flag>, FlagsmithError> {
        self.client
            .execute(&RequestDescriptor::get(FLAGS_PATH), options)
            .await?
            .json()
    }

    /// `GET identities/?identifier=..&transient=..`
    pub async fn get_identity_flags_and_traits(
        &self,
        identity: &str,
        transient: bool,
        options: RequestOptions,
    ) -> Result<IdentityFlagsAndTraits, FlagsmithError> {
        let request = RequestDescriptor::get(IDENTITIES_PATH)
            .query("identifier", identity)
            .query("transient", transient.to_string());
        self.client.execute(&request, options).await?.json()
    }

    /// `POST identities/`: upsert traits and get the resulting flags. Never
    /// cached.
    pub async fn post_traits(
        &self,
        body: &IdentityAndTraits,
    ) -> Result<IdentityFlagsAndTraits, FlagsmithError> {
        let request = RequestDescriptor::post(IDENTITIES_PATH, serde_json::to_value(body)?);
        self.client
            .execute(&request, RequestOptions::default())
            .await?
            .json()
    }

    /// `POST analytics/flags/` with a feature name to evaluation count map.
    pub async fn post_analytics(
        &self,
        counts: &HashMap<String, u64>,
    ) -> Result<(), FlagsmithError> {
        let request = RequestDescriptor::post(ANALYTICS_PATH, serde_json::to_value(counts)?);
        self.client
            .execute(&request, RequestOptions::default())
            .await?;
        Ok(())
    }
}
