//! HTTP clients for other sites: replica sources, site clients and the
//! execution backend.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tessera_orchestration::{
    ExecutionBackend, RuleSourceConnector, SiteClient, SiteConnector, SiteError, StepInvocation,
};
use tessera_policy::SignedRule;
use tessera_replication::{ReplicaSource, ReplicaUpdate, Replicable, ReplicationError};
use tessera_types::{
    Asset, AssetPayload, ExecutionRequest, Identifier, JobResult, SiteDescription,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the HTTP client shared by every outgoing call.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("tessera/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// The `error` field of a JSON error response, or the status line.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}

fn base_url(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Pulls replica updates from `GET <url>?from_version=N`.
pub struct HttpReplicaSource<T> {
    client: reqwest::Client,
    url: String,
    _objects: PhantomData<fn() -> T>,
}

impl<T> HttpReplicaSource<T> {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            _objects: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Replicable> ReplicaSource<T> for HttpReplicaSource<T> {
    async fn get_update(&self, from_version: u64) -> Result<ReplicaUpdate<T>, ReplicationError> {
        let url = format!("{}?from_version={from_version}", self.url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ReplicationError::Source(format!("{}: {e}", self.url)))?;
        if !resp.status().is_success() {
            let message = error_message(resp).await;
            return Err(ReplicationError::Source(format!("{}: {message}", self.url)));
        }
        resp.json()
            .await
            .map_err(|e| ReplicationError::Source(format!("{}: bad update: {e}", self.url)))
    }
}

/// Reaches the rule stores of other policy-serving sites.
pub struct HttpRuleConnector {
    client: reqwest::Client,
}

impl HttpRuleConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl RuleSourceConnector for HttpRuleConnector {
    fn connect(&self, site: &SiteDescription) -> Arc<dyn ReplicaSource<SignedRule>> {
        Arc::new(HttpReplicaSource::new(
            self.client.clone(),
            format!("{}/rules/updates", base_url(&site.endpoint)),
        ))
    }
}

/// Talks to a remote site's `/execute` and `/assets` endpoints.
pub struct HttpSiteClient {
    client: reqwest::Client,
    base: String,
}

impl HttpSiteClient {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            base: base_url(endpoint),
        }
    }

    fn unreachable(&self, e: reqwest::Error) -> SiteError {
        SiteError::Unreachable(format!("{}: {e}", self.base))
    }
}

async fn site_error(resp: reqwest::Response) -> SiteError {
    let status = resp.status();
    let message = error_message(resp).await;
    match status {
        reqwest::StatusCode::FORBIDDEN => SiteError::Refused(message),
        reqwest::StatusCode::SERVICE_UNAVAILABLE | reqwest::StatusCode::BAD_GATEWAY => {
            SiteError::Unreachable(message)
        }
        _ => SiteError::Failed(message),
    }
}

#[async_trait]
impl SiteClient for HttpSiteClient {
    async fn execute(&self, request: ExecutionRequest) -> Result<JobResult, SiteError> {
        let resp = self
            .client
            .post(format!("{}/execute", self.base))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !resp.status().is_success() {
            return Err(site_error(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| SiteError::Failed(format!("bad result from {}: {e}", self.base)))
    }

    async fn fetch_asset(
        &self,
        id: &Identifier,
        requester: &Identifier,
    ) -> Result<Asset, SiteError> {
        let resp = self
            .client
            .get(format!("{}/assets/{id}?requester={requester}", self.base))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !resp.status().is_success() {
            return Err(site_error(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| SiteError::Failed(format!("bad asset from {}: {e}", self.base)))
    }

    async fn store_asset(&self, asset: Asset) -> Result<(), SiteError> {
        let resp = self
            .client
            .post(format!("{}/assets", self.base))
            .json(&asset)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !resp.status().is_success() {
            return Err(site_error(resp).await);
        }
        Ok(())
    }
}

/// Opens HTTP channels to sites, short-circuiting to an in-process client
/// for this site itself.
pub struct HttpSiteConnector {
    client: reqwest::Client,
    local: Option<(Identifier, Arc<dyn SiteClient>)>,
}

impl HttpSiteConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            local: None,
        }
    }

    pub fn with_local(mut self, site: Identifier, client: Arc<dyn SiteClient>) -> Self {
        self.local = Some((site, client));
        self
    }
}

impl SiteConnector for HttpSiteConnector {
    fn connect(&self, site: &SiteDescription) -> Arc<dyn SiteClient> {
        match &self.local {
            Some((id, client)) if id == &site.id => Arc::clone(client),
            _ => Arc::new(HttpSiteClient::new(self.client.clone(), &site.endpoint)),
        }
    }
}

/// Hands step invocations to an external runner over HTTP.
///
/// The runner answers with the payload of every output, by output name.
pub struct HttpExecutionBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpExecutionBackend {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for HttpExecutionBackend {
    async fn run(
        &self,
        invocation: StepInvocation,
    ) -> Result<BTreeMap<String, AssetPayload>, String> {
        let resp = self
            .client
            .post(&self.url)
            .json(&invocation)
            .send()
            .await
            .map_err(|e| format!("execution backend unreachable: {e}"))?;
        if !resp.status().is_success() {
            return Err(error_message(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| format!("bad backend response: {e}"))
    }
}

/// Used when no execution backend is configured; every step fails.
pub struct NoBackend;

#[async_trait]
impl ExecutionBackend for NoBackend {
    async fn run(
        &self,
        invocation: StepInvocation,
    ) -> Result<BTreeMap<String, AssetPayload>, String> {
        Err(format!(
            "no execution backend configured for step '{}'",
            invocation.step
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::SiteCapabilities;

    fn site(id: &str, endpoint: &str) -> SiteDescription {
        SiteDescription {
            id: Identifier::parse(id).unwrap(),
            owner_id: Identifier::parse("party:ns:owner").unwrap(),
            admin_id: Identifier::parse("party:ns:owner").unwrap(),
            endpoint: endpoint.to_string(),
            certificate: None,
            namespace: None,
            capabilities: SiteCapabilities::default(),
        }
    }

    struct Dummy;

    #[async_trait]
    impl SiteClient for Dummy {
        async fn execute(&self, _: ExecutionRequest) -> Result<JobResult, SiteError> {
            Err(SiteError::Failed("dummy".into()))
        }
        async fn fetch_asset(&self, id: &Identifier, _: &Identifier) -> Result<Asset, SiteError> {
            Err(SiteError::Failed(id.to_string()))
        }
        async fn store_asset(&self, _: Asset) -> Result<(), SiteError> {
            Ok(())
        }
    }

    #[test]
    fn own_site_is_served_in_process() {
        let local: Arc<dyn SiteClient> = Arc::new(Dummy);
        let connector = HttpSiteConnector::new(build_http_client())
            .with_local(Identifier::parse("site:ns:me").unwrap(), Arc::clone(&local));

        let mine = connector.connect(&site("site:ns:me", "http://me/"));
        assert!(Arc::ptr_eq(&mine, &local));
        let other = connector.connect(&site("site:ns:other", "http://other/"));
        assert!(!Arc::ptr_eq(&other, &local));
    }

    #[tokio::test]
    async fn unreachable_source_is_a_source_error() {
        let source: HttpReplicaSource<SignedRule> =
            HttpReplicaSource::new(build_http_client(), "http://127.0.0.1:9/rules/updates");
        assert!(matches!(
            source.get_update(0).await,
            Err(ReplicationError::Source(_))
        ));
    }

    #[test]
    fn endpoints_lose_trailing_slashes() {
        assert_eq!(base_url("http://site:4000/"), "http://site:4000");
    }
}
