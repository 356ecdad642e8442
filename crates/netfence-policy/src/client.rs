//! Networking backend client
//!
//! [`PolicyBackend`] is the seam between the reconciliation core and the
//! backend's REST API. [`HttpBackend`] is the production implementation:
//! listings go through the search API filtered to this cluster's tag, writes
//! go through the hierarchical `PATCH /infra` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use netfence_common::model::{BackendObject, Group, Infra, Policy, Rule};
use netfence_common::{Error, Result, TAG_SCOPE_CLUSTER};

const SEARCH_PATH: &str = "/policy/api/v1/search/query";
const INFRA_PATH: &str = "/policy/api/v1/infra";

/// Trait abstracting the networking backend
///
/// This trait allows mocking the backend in tests while using the HTTP
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// List every security policy tagged with this cluster
    async fn list_security_policies(&self) -> Result<Vec<Policy>>;

    /// List every rule tagged with this cluster
    async fn list_rules(&self) -> Result<Vec<Rule>>;

    /// List every group tagged with this cluster
    async fn list_groups(&self) -> Result<Vec<Group>>;

    /// Apply a hierarchical patch
    ///
    /// Objects carrying `marked_for_delete` are removed, all others are
    /// created or replaced.
    async fn patch_infra(&self, infra: &Infra, enforce_revision_check: bool) -> Result<()>;

    /// Create or replace a single group in `domain`
    async fn patch_group(&self, domain: &str, group: &Group) -> Result<()>;
}

/// Connection settings for [`HttpBackend`]
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Base URL of the manager, e.g. `https://nsx.example.com`
    pub base_url: String,
    /// Basic auth user
    pub username: String,
    /// Basic auth password
    pub password: String,
    /// Cluster tag value listings are filtered on
    pub cluster: String,
    /// Accept any server certificate
    pub insecure_skip_tls_verify: bool,
    /// Per-request timeout
    pub request_timeout: Duration,
}

/// One page of search results
#[derive(Debug, Deserialize)]
struct SearchPage<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    cursor: Option<String>,
}

/// HTTP implementation of [`PolicyBackend`]
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl HttpBackend {
    /// Create a client from `config`
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .map_err(|e| Error::backend("client", e.to_string()))?;

        Ok(Self { client, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        self.client
            .request(method, url)
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    /// Search query selecting objects of `resource_type` owned by this cluster
    fn search_query(&self, resource_type: &str) -> String {
        // The search syntax treats '/' as a regex delimiter
        format!(
            "resource_type:{} AND tags.scope:{} AND tags.tag:{}",
            resource_type,
            TAG_SCOPE_CLUSTER.replace('/', "\\/"),
            self.config.cluster.replace('/', "\\/"),
        )
    }

    /// Follow search cursors until the listing is exhausted
    async fn search<T: BackendObject + DeserializeOwned>(
        &self,
        resource_type: &str,
    ) -> Result<Vec<T>> {
        let operation = format!("list {}", T::KIND);
        let query = self.search_query(resource_type);
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![("query", query.clone())];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }

            let response = self
                .request(Method::GET, SEARCH_PATH)
                .query(&params)
                .send()
                .await
                .map_err(|e| Error::backend(&operation, e.to_string()))?;
            let response = check_status(&operation, response).await?;
            let page: SearchPage<T> = response
                .json()
                .await
                .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;

            let fetched = page.results.len();
            objects.extend(page.results);

            match page.cursor {
                Some(next) if fetched > 0 && !next.is_empty() && cursor.as_ref() != Some(&next) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        debug!(kind = T::KIND, count = objects.len(), "listed backend objects");
        Ok(objects)
    }
}

/// Turn a non-success response into a backend error carrying status and body
async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::backend_status(operation, status.as_u16(), body))
}

#[async_trait]
impl PolicyBackend for HttpBackend {
    async fn list_security_policies(&self) -> Result<Vec<Policy>> {
        self.search("SecurityPolicy").await
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.search("Rule").await
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        self.search("Group").await
    }

    #[instrument(skip(self, infra))]
    async fn patch_infra(&self, infra: &Infra, enforce_revision_check: bool) -> Result<()> {
        let response = self
            .request(Method::PATCH, INFRA_PATH)
            .query(&[("enforce_revision_check", enforce_revision_check)])
            .json(infra)
            .send()
            .await
            .map_err(|e| Error::backend("patch infra", e.to_string()))?;
        check_status("patch infra", response).await?;
        Ok(())
    }

    #[instrument(skip(self, group), fields(group = %group.id))]
    async fn patch_group(&self, domain: &str, group: &Group) -> Result<()> {
        let path = format!("{}/domains/{}/groups/{}", INFRA_PATH, domain, group.id);
        let response = self
            .request(Method::PATCH, &path)
            .json(group)
            .send()
            .await
            .map_err(|e| Error::backend("patch group", e.to_string()))?;
        check_status("patch group", response).await?;
        Ok(())
    }
}
