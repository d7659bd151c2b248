//! Transport boundary.
//!
//! The cache consumes one fetcher and one mutator per resource kind; both
//! are folded into [`ResourceTransport`]. [`HttpTransport`] speaks the
//! platform REST API; tests substitute scripted implementations.
//!
//! Classification contract: transport-level failures and 5xx responses are
//! network failures (retryable), 422 is a validation failure, any other
//! non-success status is a rejection. The caller never sees a raw
//! `reqwest::Error`.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde_json::Value;

use crate::error::TransportError;
use crate::key::{CacheKey, Scope};
use crate::kind::ResourceKind;

/// Supplies the bearer credential attached to every request.
///
/// Issuance and refresh live with the authentication collaborator; a
/// provider failure is reported as a network failure because the request
/// never reached the server.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<String, TransportError>;
}

/// A fixed token. Used by tools and tests.
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self) -> Result<String, TransportError> {
        Ok(self.token.clone())
    }
}

/// Remote CRUD endpoint family for the five resource collections.
#[async_trait]
pub trait ResourceTransport: Send + Sync {
    /// Loads the resource or collection addressed by `key`.
    async fn fetch(&self, key: &CacheKey) -> Result<Value, TransportError>;

    /// Creates a resource and returns the authoritative representation.
    async fn create(&self, kind: ResourceKind, payload: &Value) -> Result<Value, TransportError>;

    /// Updates a resource and returns the authoritative representation.
    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        payload: &Value,
    ) -> Result<Value, TransportError>;

    /// Deletes a resource.
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), TransportError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpTransport {
    client: Client,
    base: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpTransport {
    pub fn new(
        base: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, TransportError> {
        let base = Url::parse(base)
            .and_then(|url| url.join("/"))
            .map_err(|err| TransportError::validation(format!("invalid base URL: {err}")))?;
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .build()
            .map_err(|err| TransportError::network(err.to_string()))?;
        Ok(Self {
            client,
            base,
            credentials,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("agora-sync/", env!("CARGO_PKG_VERSION"))
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Response, TransportError> {
        let token = self.credentials.credential().await?;
        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|err| TransportError::network(err.to_string()))
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|err| TransportError::validation(format!("invalid request path: {err}")))
    }
}

#[async_trait]
impl ResourceTransport for HttpTransport {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, TransportError> {
        let url = fetch_url(&self.base, key)?;
        let response = self.request(Method::GET, url, None).await?;
        decode_body(response).await
    }

    async fn create(&self, kind: ResourceKind, payload: &Value) -> Result<Value, TransportError> {
        let url = self.url(&format!("api/{}", kind.route()))?;
        let response = self.request(Method::POST, url, Some(payload)).await?;
        decode_body(response).await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        payload: &Value,
    ) -> Result<Value, TransportError> {
        let url = self.url(&format!("api/{}/{id}", kind.route()))?;
        let response = self.request(Method::PATCH, url, Some(payload)).await?;
        decode_body(response).await
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), TransportError> {
        let url = self.url(&format!("api/{}/{id}", kind.route()))?;
        let response = self.request(Method::DELETE, url, None).await?;
        check_status(response).await
    }
}

fn fetch_path(key: &CacheKey) -> Result<String, TransportError> {
    let route = key.kind().route();
    match key.scope() {
        Scope::List => Ok(format!("api/{route}")),
        Scope::Stats => Ok(format!("api/{route}/stats")),
        Scope::Detail => key
            .id()
            .map(|id| format!("api/{route}/{id}"))
            .ok_or_else(|| TransportError::validation("detail key without identifier")),
    }
}

fn fetch_url(base: &Url, key: &CacheKey) -> Result<Url, TransportError> {
    let mut url = base
        .join(&fetch_path(key)?)
        .map_err(|err| TransportError::validation(format!("invalid request path: {err}")))?;
    if let Some(filter) = key.filter() {
        url.query_pairs_mut().append_pair("filter", filter.as_str());
    }
    Ok(url)
}

async fn decode_body(response: Response) -> Result<Value, TransportError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| TransportError::network(err.to_string()))?;
    classify_status(status, &bytes)?;
    serde_json::from_slice(&bytes)
        .map_err(|err| TransportError::validation(format!("failed to parse body: {err}")))
}

async fn check_status(response: Response) -> Result<(), TransportError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| TransportError::network(err.to_string()))?;
    classify_status(status, &bytes)
}

fn classify_status(status: StatusCode, body: &[u8]) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    let message = String::from_utf8_lossy(body).into_owned();
    if status.is_server_error() {
        Err(TransportError::network(format!("status {status}: {message}")))
    } else if status == StatusCode::UNPROCESSABLE_ENTITY {
        Err(TransportError::validation(message))
    } else {
        Err(TransportError::rejected(status.as_u16(), message))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn base() -> Url {
        Url::parse("https://agora.example/").expect("base url")
    }

    #[test]
    fn fetch_urls_follow_collection_routes() {
        let list = fetch_url(&base(), &CacheKey::list(ResourceKind::Bounty)).expect("list url");
        assert_eq!(list.as_str(), "https://agora.example/api/bounties");

        let detail = fetch_url(&base(), &CacheKey::detail(ResourceKind::ForumPost, "p1"))
            .expect("detail url");
        assert_eq!(detail.as_str(), "https://agora.example/api/forum/posts/p1");

        let stats =
            fetch_url(&base(), &CacheKey::stats(ResourceKind::Member)).expect("stats url");
        assert_eq!(stats.as_str(), "https://agora.example/api/members/stats");
    }

    #[test]
    fn filtered_lists_carry_the_canonical_filter() {
        let key = CacheKey::filtered_list(ResourceKind::Project, &json!({"status": "open"}));
        let url = fetch_url(&base(), &key).expect("filtered url");

        assert!(url.as_str().starts_with("https://agora.example/api/projects?filter="));
        let (_, filter) = url.query_pairs().next().expect("filter pair");
        assert_eq!(filter, r#"{"status":"open"}"#);
    }

    #[test]
    fn statuses_classify_into_the_error_taxonomy() {
        assert!(classify_status(StatusCode::OK, b"").is_ok());

        let err = classify_status(StatusCode::BAD_GATEWAY, b"upstream down").expect_err("5xx");
        assert!(err.is_transient());

        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, b"bad title").expect_err("422");
        assert!(matches!(err, TransportError::Validation { .. }));

        let err = classify_status(StatusCode::FORBIDDEN, b"nope").expect_err("4xx");
        assert!(matches!(err, TransportError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn static_credentials_hand_back_the_token() {
        let provider = StaticCredentials::new("token-1");
        assert_eq!(provider.credential().await.expect("token"), "token-1");
    }
}
