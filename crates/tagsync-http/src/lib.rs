//! HTTP/JSON implementation of [`ResourceStore`].
//!
//! Talks to a tagging endpoint exposing:
//!
//! | Call | Request |
//! |------|---------|
//! | list policies | `GET /policies?scope=local[&page_token=T]` |
//! | attached roles | `GET /policies/{id}/roles` |
//! | tag | `PUT /policies/{id}/tags` with `{"tags": {..}}` |
//! | untag | `DELETE /policies/{id}/tags?key=K&key=K2` |
//! | batched update | `POST /policies/{id}/tags` with `{"set": {..}, "remove": [..]}` |
//!
//! Every request carries the configured region and, when set, the run id as
//! `x-tagsync-region` / `x-tagsync-run-id` headers.

#![forbid(unsafe_code)]

pub mod error;

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tagsync_core::config::StoreConfig;
use tagsync_core::{ConfigError, IdentityRole, PolicyPage, ResourceStore, StoreError, TagMap};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

pub use error::{HttpStoreError, classify_status, classify_transport, retry_after};

/// Header carrying the account region.
pub const REGION_HEADER: &str = "x-tagsync-region";
/// Header carrying the run id, for correlating server-side logs.
pub const RUN_ID_HEADER: &str = "x-tagsync-run-id";

#[derive(Deserialize)]
struct RolesResponse {
    #[serde(default)]
    roles: Vec<IdentityRole>,
}

#[derive(Serialize)]
struct TagRequest<'a> {
    tags: &'a TagMap,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    set: &'a TagMap,
    remove: &'a BTreeSet<String>,
}

/// Resource store backed by an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpResourceStore {
    client: Client,
    base: Url,
    region: String,
    run_id: Option<Uuid>,
    batched: bool,
}

impl HttpResourceStore {
    /// Build a store from validated settings.
    pub fn new(config: &StoreConfig) -> Result<Self, HttpStoreError> {
        let base = config.endpoint_url()?;
        let region = config
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ConfigError::Invalid {
                field: "store.region",
                message: "must be set".to_string(),
            })?
            .to_string();

        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("tagsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base,
            region,
            run_id: None,
            batched: config.batched_updates,
        })
    }

    /// Tag every request with `run_id`.
    #[must_use]
    pub const fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    /// `base` joined with `segments`, each percent-encoded as one segment.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                StoreError::Rejected(format!("endpoint {} cannot take a path", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(REGION_HEADER, &self.region);
        match self.run_id {
            Some(run_id) => builder.header(RUN_ID_HEADER, run_id.to_string()),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "Store responded");
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &headers, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, StoreError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| classify_transport(&e))
    }
}

#[async_trait]
impl ResourceStore for HttpResourceStore {
    #[instrument(skip(self))]
    async fn list_policies(&self, page_token: Option<&str>) -> Result<PolicyPage, StoreError> {
        let mut url = self.url(&["policies"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("scope", "local");
            if let Some(token) = page_token {
                query.append_pair("page_token", token);
            }
        }
        self.send_json(self.request(Method::GET, url)).await
    }

    #[instrument(skip(self))]
    async fn list_attached_roles(&self, policy_id: &str) -> Result<Vec<IdentityRole>, StoreError> {
        let url = self.url(&["policies", policy_id, "roles"])?;
        let response: RolesResponse = self.send_json(self.request(Method::GET, url)).await?;
        Ok(response.roles)
    }

    #[instrument(skip(self, tags), fields(count = tags.len()))]
    async fn tag_policy(&self, policy_id: &str, tags: &TagMap) -> Result<(), StoreError> {
        let url = self.url(&["policies", policy_id, "tags"])?;
        self.send(self.request(Method::PUT, url).json(&TagRequest { tags }))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn untag_policy(
        &self,
        policy_id: &str,
        keys: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let mut url = self.url(&["policies", policy_id, "tags"])?;
        url.query_pairs_mut()
            .extend_pairs(keys.iter().map(|k| ("key", k.as_str())));
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    fn supports_batched_update(&self) -> bool {
        self.batched
    }

    #[instrument(skip(self, set, remove), fields(set = set.len(), remove = remove.len()))]
    async fn update_policy_tags(
        &self,
        policy_id: &str,
        set: &TagMap,
        remove: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        if !self.batched {
            return Err(StoreError::Unsupported("update_policy_tags"));
        }
        let url = self.url(&["policies", policy_id, "tags"])?;
        self.send(
            self.request(Method::POST, url)
                .json(&UpdateRequest { set, remove }),
        )
        .await?;
        Ok(())
    }
}
