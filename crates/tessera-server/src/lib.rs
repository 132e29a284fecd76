//! Tessera site daemon library logic.
//!
//! A site serves its own rule store (if it serves policy), optionally the
//! registry, executes the workflow steps assigned to it, and orchestrates
//! jobs submitted to it. Everything here is transport glue around the
//! library crates.

pub mod api;
pub mod background;
pub mod config;
pub mod remote;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use tessera_db::DbPool;
use tessera_orchestration::{
    AssetService, ExecutionBackend, FreshnessSettings, LocalSiteClient, MemoryAssetStore,
    Orchestrator, Planner, PolicyClient, SiteExecutor,
};
use tessera_policy::{RuleStore, SignatureVerifier};
use tessera_registry::{Registry, RegistryClient};
use tessera_types::Identifier;

use crate::api::ApiError;
use crate::remote::HttpSiteConnector;

/// Maximum request body size (16 MiB). Assets travel inline.
const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Application state shared across all request handlers.
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// This site's identifier.
    pub site_id: Identifier,
    /// The registry, when this site hosts it.
    pub registry: Option<Arc<Registry>>,
    pub registry_client: RegistryClient,
    /// The rule store of the namespace this site serves, if any.
    pub rules: Option<Arc<RuleStore>>,
    pub policy: Arc<PolicyClient>,
    pub executor: Arc<SiteExecutor>,
    pub orchestrator: Arc<Orchestrator>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub freshness: FreshnessSettings,
}

/// The pieces a site is assembled from.
pub struct SiteComponents {
    pub pool: DbPool,
    pub site_id: Identifier,
    pub registry: Option<Arc<Registry>>,
    pub registry_client: RegistryClient,
    pub policy: Arc<PolicyClient>,
    pub backend: Arc<dyn ExecutionBackend>,
    /// Channels to other sites. The connection to this site is added here.
    pub sites: HttpSiteConnector,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub freshness: FreshnessSettings,
    /// Whether planning and plan checks also cover step outputs.
    pub check_outputs: bool,
}

impl AppState {
    /// Wires the executor, planner and orchestrator around `components`.
    pub fn assemble(components: SiteComponents) -> Self {
        let SiteComponents {
            pool,
            site_id,
            registry,
            registry_client,
            policy,
            backend,
            sites,
            verifier,
            freshness,
            check_outputs,
        } = components;

        let assets = AssetService::new(Arc::new(MemoryAssetStore::new()), policy.clone());
        let executor = Arc::new(
            SiteExecutor::new(site_id.clone(), assets, policy.clone(), backend)
                .with_output_checks(check_outputs),
        );
        let sites = sites.with_local(
            site_id.clone(),
            Arc::new(LocalSiteClient::new(Arc::clone(&executor))),
        );
        let orchestrator = Orchestrator::new(
            Planner::new(policy.clone(), registry_client.clone())
                .with_output_checks(check_outputs),
            registry_client.clone(),
            Arc::new(sites),
        );

        Self {
            pool,
            site_id,
            registry,
            rules: policy.local_store().cloned(),
            registry_client,
            policy,
            executor,
            orchestrator,
            verifier,
            freshness,
        }
    }

    /// Refreshes the registry replica if its lease has run out.
    pub(crate) async fn fresh_registry(&self) -> Result<(), ApiError> {
        self.registry_client
            .ensure_fresh_within(self.freshness.timeout, self.freshness.min_backoff)
            .await?;
        Ok(())
    }
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "site": state.site_id,
        "registry_version": state.registry_client.replica().version(),
        "rules_version": state.rules.as_ref().map(|rules| rules.version()),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rules/updates", get(api::rule_updates_handler))
        .route(
            "/rules",
            get(api::list_rules_handler).post(api::add_rule_handler),
        )
        .route("/rules/retract", post(api::retract_rule_handler))
        .route("/registry/updates", get(api::registry_updates_handler))
        .route(
            "/registry/parties",
            get(api::list_parties_handler).post(api::register_party_handler),
        )
        .route(
            "/registry/parties/{id}",
            delete(api::deregister_party_handler),
        )
        .route(
            "/registry/sites",
            get(api::list_sites_handler).post(api::register_site_handler),
        )
        .route("/registry/sites/{id}", delete(api::deregister_site_handler))
        .route("/jobs", post(api::submit_job_handler))
        .route("/jobs/{id}", get(api::job_status_handler))
        .route("/execute", post(api::execute_handler))
        .route("/assets", post(api::store_asset_handler))
        .route("/assets/{id}", get(api::get_asset_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}
