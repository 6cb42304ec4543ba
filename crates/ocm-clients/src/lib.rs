//! HTTP plumbing and REST clients for the source platform and the two
//! destination APIs (provider portal + marketplace).

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ocm_core::{
    CatalogueResource, Customer, Offer, OfferPayload, Offering, Provider, ProviderPayload,
    ResourcePayload,
};

pub const CRATE_NAME: &str = "ocm-clients";

/// Custom-attribute filter that marks offerings as opted in to catalogue sync.
pub const SYNC_ATTRIBUTE_FILTER: &str = r#"{"enable_catalogue_sync":true}"#;

/// Marketplace authentication header. The marketplace API does not share the
/// provider portal's bearer token.
const USER_TOKEN_HEADER: &str = "X-User-Token";

const TOKEN_SCOPE: &str = "openid email profile";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Build the shared reqwest client all three API clients use.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<Client> {
    let mut builder = Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("token endpoint returned no access token")]
    MissingAccessToken,
}

async fn status_error(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    ClientError::Status { status, url, body }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Exchanges the long-lived refresh credential for a short-lived access
/// token against the identity endpoint.
///
/// The token is cached behind an async mutex with a short max-age so a sync
/// cycle reuses one exchange instead of one per call; a 401 from any portal
/// call invalidates the cache and the call retries once with a fresh token.
#[derive(Debug)]
pub struct TokenProvider {
    http: Client,
    token_url: String,
    refresh_token: String,
    client_id: String,
    max_age: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(
        http: Client,
        token_url: impl Into<String>,
        refresh_token: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            refresh_token: refresh_token.into(),
            client_id: client_id.into(),
            max_age: Duration::from_secs(240),
            cached: Mutex::new(None),
        }
    }

    /// Current access token, re-exchanged when the cached one is stale.
    pub async fn access_token(&self) -> Result<String, ClientError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.fetched_at.elapsed() < self.max_age {
                return Ok(token.value.clone());
            }
        }

        let value = self.exchange().await?;
        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn exchange(&self) -> Result<String, ClientError> {
        debug!(url = %self.token_url, "exchanging refresh token");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("scope", TOKEN_SCOPE),
        ];
        let response = self.http.post(&self.token_url).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: TokenResponse = response.json().await?;
        if body.access_token.is_empty() {
            return Err(ClientError::MissingAccessToken);
        }
        Ok(body.access_token)
    }
}

/// Read-only view of the source platform.
#[async_trait]
pub trait SourcePlatform: Send + Sync {
    /// Offerings flagged for catalogue sync, optionally scoped to one customer.
    async fn list_sync_enabled_offerings(
        &self,
        customer_scope: Option<Uuid>,
    ) -> Result<Vec<Offering>, ClientError>;

    async fn customer(&self, uuid: Uuid) -> Result<Customer, ClientError>;

    /// Description of the customer's service-provider record, when one exists.
    async fn service_provider_description(
        &self,
        customer_uuid: Uuid,
    ) -> Result<Option<String>, ClientError>;
}

/// Destination provider-portal API: provider and resource records.
#[async_trait]
pub trait ProviderPortal: Send + Sync {
    /// Full name-to-id listing of the catalogue's resources, fetched once per cycle.
    async fn catalogue_resources(&self) -> Result<Vec<CatalogueResource>, ClientError>;

    /// `Ok(None)` on 404; any other non-200 status is an error.
    async fn provider(&self, key: &str) -> Result<Option<Provider>, ClientError>;

    async fn create_provider(&self, payload: &ProviderPayload) -> Result<Provider, ClientError>;

    /// Best-effort update. `Ok(None)` when the portal rejected the update or
    /// reported "no changes" (a 200 with a non-JSON body); the caller keeps
    /// the previously fetched record.
    async fn update_provider(
        &self,
        payload: &ProviderPayload,
    ) -> Result<Option<Provider>, ClientError>;

    async fn resource(&self, id: &str) -> Result<CatalogueResource, ClientError>;

    async fn create_resource(
        &self,
        payload: &ResourcePayload,
    ) -> Result<CatalogueResource, ClientError>;

    /// Best-effort update with the same fallback contract as `update_provider`.
    async fn update_resource(
        &self,
        payload: &ResourcePayload,
    ) -> Result<Option<CatalogueResource>, ClientError>;

    /// `Ok` on 200/204 (with the deleted record when the portal echoes one);
    /// other statuses are logged and treated as a no-op.
    async fn delete_resource(&self, id: &str) -> Result<Option<CatalogueResource>, ClientError>;
}

/// Destination marketplace API: pricing-plan offers attached to a resource.
#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn offers(&self, resource_id: &str) -> Result<Vec<Offer>, ClientError>;

    /// `Ok(None)` when the marketplace rejects the offer (non-201); one bad
    /// plan must not abort the offering.
    async fn create_offer(
        &self,
        resource_id: &str,
        payload: &OfferPayload,
    ) -> Result<Option<Offer>, ClientError>;

    async fn deactivate_offer(&self, resource_id: &str, offer_id: i64)
        -> Result<(), ClientError>;
}

/// REST client for the source platform.
#[derive(Debug)]
pub struct SourceClient {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ServiceProviderRecord {
    #[serde(default)]
    description: Option<String>,
}

impl SourceClient {
    pub fn new(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    async fn get(&self, url: String, query: &[(&str, String)]) -> Result<Response, ClientError> {
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .query(query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl SourcePlatform for SourceClient {
    async fn list_sync_enabled_offerings(
        &self,
        customer_scope: Option<Uuid>,
    ) -> Result<Vec<Offering>, ClientError> {
        let mut query = vec![("attributes", SYNC_ATTRIBUTE_FILTER.to_string())];
        if let Some(customer_uuid) = customer_scope {
            query.push(("customer_uuid", customer_uuid.to_string()));
        }
        let url = join_url(&self.base_url, "marketplace-provider-offerings/");
        let response = self.get(url, &query).await?;
        Ok(response.json().await?)
    }

    async fn customer(&self, uuid: Uuid) -> Result<Customer, ClientError> {
        let url = join_url(&self.base_url, &format!("customers/{uuid}/"));
        let response = self.get(url, &[]).await?;
        Ok(response.json().await?)
    }

    async fn service_provider_description(
        &self,
        customer_uuid: Uuid,
    ) -> Result<Option<String>, ClientError> {
        let url = join_url(&self.base_url, "marketplace-service-providers/");
        let query = [("customer_uuid", customer_uuid.to_string())];
        let response = self.get(url, &query).await?;
        let records: Vec<ServiceProviderRecord> = response.json().await?;
        Ok(records
            .into_iter()
            .next()
            .and_then(|record| record.description)
            .filter(|description| !description.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct ResourceListPage {
    #[serde(default)]
    results: Vec<CatalogueResource>,
}

/// REST client for the destination provider portal.
#[derive(Debug)]
pub struct PortalClient {
    http: Client,
    base_url: String,
    catalogue_id: String,
    tokens: TokenProvider,
}

impl PortalClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        catalogue_id: impl Into<String>,
        tokens: TokenProvider,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            catalogue_id: catalogue_id.into(),
            tokens,
        }
    }

    fn provider_url(&self, suffix: &str) -> String {
        join_url(
            &self.base_url,
            &format!("catalogue/{}/provider/{suffix}", self.catalogue_id),
        )
    }

    async fn request_once<T: Serialize>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&T>,
    ) -> Result<Response, ClientError> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// One authorized request, retried once with a fresh token on a 401.
    async fn send<T: Serialize>(
        &self,
        method: Method,
        url: String,
        query: &[(&str, &str)],
        body: Option<&T>,
    ) -> Result<Response, ClientError> {
        let response = self.request_once(method.clone(), &url, query, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
            return self.request_once(method, &url, query, body).await;
        }
        Ok(response)
    }

    async fn get(&self, url: String, query: &[(&str, &str)]) -> Result<Response, ClientError> {
        self.send::<()>(Method::GET, url, query, None).await
    }
}

#[async_trait]
impl ProviderPortal for PortalClient {
    async fn catalogue_resources(&self) -> Result<Vec<CatalogueResource>, ClientError> {
        info!(catalogue_id = %self.catalogue_id, "fetching catalogue resource snapshot");
        let url = join_url(&self.base_url, "service/byCatalogue");
        let query = [
            ("catalogue_id", self.catalogue_id.as_str()),
            ("quantity", "1000"),
        ];
        let response = self.get(url, &query).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let page: ResourceListPage = response.json().await?;
        Ok(page.results)
    }

    async fn provider(&self, key: &str) -> Result<Option<Provider>, ClientError> {
        debug!(provider = key, "fetching provider");
        let response = self.get(self.provider_url(key), &[]).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => Ok(Some(response.json().await?)),
            _ => Err(status_error(response).await),
        }
    }

    async fn create_provider(&self, payload: &ProviderPayload) -> Result<Provider, ClientError> {
        info!(provider = %payload.abbreviation, "creating provider");
        let response = self
            .send(Method::POST, self.provider_url(""), &[], Some(payload))
            .await?;
        if !matches!(response.status(), StatusCode::OK | StatusCode::CREATED) {
            return Err(status_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn update_provider(
        &self,
        payload: &ProviderPayload,
    ) -> Result<Option<Provider>, ClientError> {
        let response = self
            .send(Method::PUT, self.provider_url(""), &[], Some(payload))
            .await?;
        let status = response.status();
        if !matches!(status, StatusCode::OK | StatusCode::CREATED) {
            let body = response.text().await.unwrap_or_default();
            warn!(
                provider = ?payload.id,
                status = status.as_u16(),
                body = %body,
                "provider update rejected, keeping existing record"
            );
            return Ok(None);
        }

        // The portal answers 200 with a non-JSON error body when nothing
        // changed; fall back to the previously fetched record.
        let text = response.text().await?;
        match serde_json::from_str(&text) {
            Ok(provider) => Ok(Some(provider)),
            Err(_) => {
                info!(provider = ?payload.id, body = %text, "provider unchanged");
                Ok(None)
            }
        }
    }

    async fn resource(&self, id: &str) -> Result<CatalogueResource, ClientError> {
        let url = join_url(&self.base_url, &format!("resource/{id}"));
        let response = self.get(url, &[]).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn create_resource(
        &self,
        payload: &ResourcePayload,
    ) -> Result<CatalogueResource, ClientError> {
        info!(resource = %payload.name, "creating resource");
        let url = join_url(&self.base_url, "resource/");
        let response = self.send(Method::POST, url, &[], Some(payload)).await?;
        if !matches!(response.status(), StatusCode::OK | StatusCode::CREATED) {
            return Err(status_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn update_resource(
        &self,
        payload: &ResourcePayload,
    ) -> Result<Option<CatalogueResource>, ClientError> {
        let url = join_url(&self.base_url, "resource/");
        let response = self.send(Method::PUT, url, &[], Some(payload)).await?;
        let status = response.status();
        if !matches!(status, StatusCode::OK | StatusCode::CREATED) {
            let body = response.text().await.unwrap_or_default();
            warn!(
                resource = ?payload.id,
                status = status.as_u16(),
                body = %body,
                "resource update rejected, keeping existing record"
            );
            return Ok(None);
        }

        let text = response.text().await?;
        match serde_json::from_str(&text) {
            Ok(resource) => Ok(Some(resource)),
            Err(_) => {
                info!(resource = ?payload.id, body = %text, "resource unchanged");
                Ok(None)
            }
        }
    }

    async fn delete_resource(&self, id: &str) -> Result<Option<CatalogueResource>, ClientError> {
        info!(resource = id, "deleting resource");
        let url = join_url(&self.base_url, &format!("resource/{id}"));
        let response = self.send::<()>(Method::DELETE, url, &[], None).await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => Ok(response.json().await.ok()),
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(
                    resource = id,
                    status = status.as_u16(),
                    body = %body,
                    "unable to delete resource"
                );
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct OfferListEnvelope {
    #[serde(default)]
    offers: Vec<Offer>,
}

/// REST client for the destination marketplace's offer API.
#[derive(Debug)]
pub struct MarketClient {
    http: Client,
    base_url: String,
    user_token: String,
}

impl MarketClient {
    pub fn new(http: Client, base_url: impl Into<String>, user_token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            user_token: user_token.into(),
        }
    }

    fn offers_url(&self, resource_id: &str) -> String {
        join_url(
            &self.base_url,
            &format!("api/v1/resources/{resource_id}/offers/"),
        )
    }
}

#[async_trait]
impl Marketplace for MarketClient {
    async fn offers(&self, resource_id: &str) -> Result<Vec<Offer>, ClientError> {
        let response = self
            .http
            .get(self.offers_url(resource_id))
            .header(ACCEPT, "application/json")
            .header(USER_TOKEN_HEADER, &self.user_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let envelope: OfferListEnvelope = response.json().await?;
        Ok(envelope.offers)
    }

    async fn create_offer(
        &self,
        resource_id: &str,
        payload: &OfferPayload,
    ) -> Result<Option<Offer>, ClientError> {
        let response = self
            .http
            .post(self.offers_url(resource_id))
            .header(ACCEPT, "application/json")
            .header(USER_TOKEN_HEADER, &self.user_token)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            error!(
                resource = resource_id,
                offer = %payload.name,
                status = status.as_u16(),
                body = %body,
                "failed to create offer"
            );
            return Ok(None);
        }
        let offer: Offer = response.json().await?;
        info!(resource = resource_id, offer = %offer.name, "created offer");
        Ok(Some(offer))
    }

    async fn deactivate_offer(
        &self,
        resource_id: &str,
        offer_id: i64,
    ) -> Result<(), ClientError> {
        let url = join_url(
            &self.base_url,
            &format!("api/v1/resources/{resource_id}/offers/{offer_id}"),
        );
        let response = self
            .http
            .delete(url)
            .header(ACCEPT, "*/*")
            .header(USER_TOKEN_HEADER, &self.user_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://portal.example.org/api/", "/resource/"),
            "https://portal.example.org/api/resource/"
        );
        assert_eq!(
            join_url("https://portal.example.org/api", "service/byCatalogue"),
            "https://portal.example.org/api/service/byCatalogue"
        );
    }

    #[test]
    fn resource_list_page_tolerates_extra_fields() {
        let page: ResourceListPage = serde_json::from_str(
            r#"{"results": [{"id": "cat.svc-one", "name": "Service One", "trl": "trl-9"}], "total": 1}"#,
        )
        .expect("parse");
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.results[0].id, "cat.svc-one");
    }

    #[test]
    fn offer_envelope_defaults_to_empty() {
        let envelope: OfferListEnvelope = serde_json::from_str("{}").expect("parse");
        assert!(envelope.offers.is_empty());
    }

    #[test]
    fn token_response_may_be_incomplete() {
        let body: TokenResponse = serde_json::from_str(r#"{"error": "invalid_grant"}"#)
            .expect("parse");
        assert!(body.access_token.is_empty());
    }

    #[test]
    fn sync_filter_is_json_encoded() {
        let parsed: serde_json::Value =
            serde_json::from_str(SYNC_ATTRIBUTE_FILTER).expect("filter must stay valid JSON");
        assert_eq!(parsed["enable_catalogue_sync"], true);
    }
}
