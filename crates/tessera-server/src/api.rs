//! API handlers for a Tessera site.

use crate::AppState;
use axum::{
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use tessera_orchestration::{
    AssetError, JobId, JobStatus, OrchestrationError, PlanningError, SiteError,
};
use tessera_policy::{retraction_message, PolicyError, Rule, SignedRule};
use tessera_registry::{RegisteredObject, Registry, RegistryError};
use tessera_replication::ReplicaUpdate;
use tessera_types::{
    Asset, ExecutionRequest, Identifier, Job, JobResult, PartyDescription, Plan, SiteDescription,
};

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The request is well formed but cannot be carried out, e.g. a job
    /// with no legal plan.
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    /// Policy or the registry cannot currently be trusted.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        let message = e.to_string();
        match e {
            PolicyError::InvalidSignature { .. }
            | PolicyError::UnauthorizedIssuer { .. }
            | PolicyError::Unauthorized { .. } => ApiError::Forbidden(message),
            PolicyError::NotFound(_) => ApiError::NotFound(message),
            PolicyError::Malformed(_) => ApiError::BadRequest(message),
            PolicyError::Replication(_) => ApiError::Unavailable(message),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let message = e.to_string();
        match e {
            RegistryError::AlreadyRegistered(_)
            | RegistryError::NamespaceTaken { .. }
            | RegistryError::InUse { .. } => ApiError::Conflict(message),
            RegistryError::NotFound(_) => ApiError::NotFound(message),
            RegistryError::MissingParty { .. } | RegistryError::Invalid(_) => {
                ApiError::BadRequest(message)
            }
            RegistryError::Replication(_) => ApiError::Unavailable(message),
        }
    }
}

impl From<PlanningError> for ApiError {
    fn from(e: PlanningError) -> Self {
        match e {
            PlanningError::Infeasible { .. } => ApiError::Unprocessable(e.to_string()),
            PlanningError::Policy(e) => e.into(),
            PlanningError::Registry(e) => e.into(),
        }
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(e: OrchestrationError) -> Self {
        match e {
            OrchestrationError::Planning(e) => e.into(),
            OrchestrationError::Registry(e) => e.into(),
            OrchestrationError::UnknownJob(_) => ApiError::NotFound(e.to_string()),
            OrchestrationError::RemoteExecutionFailure { .. } => {
                ApiError::InternalServerError(e.to_string())
            }
        }
    }
}

impl From<AssetError> for ApiError {
    fn from(e: AssetError) -> Self {
        let message = e.to_string();
        match e {
            AssetError::NotFound(_) => ApiError::NotFound(message),
            AssetError::AccessDenied { .. } => ApiError::Forbidden(message),
            AssetError::Invalid(_) => ApiError::BadRequest(message),
            AssetError::Policy(e) => e.into(),
        }
    }
}

impl From<SiteError> for ApiError {
    fn from(e: SiteError) -> Self {
        let message = e.to_string();
        match e {
            SiteError::Refused(_) => ApiError::Forbidden(message),
            SiteError::Unreachable(_) => ApiError::Unavailable(message),
            SiteError::Failed(_) => ApiError::InternalServerError(message),
            SiteError::Asset(e) => e.into(),
            SiteError::Policy(e) => e.into(),
        }
    }
}

fn parse_id(text: &str) -> Result<Identifier, ApiError> {
    Identifier::parse(text).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Query of the replica update endpoints.
#[derive(Debug, Deserialize)]
pub struct UpdatesQuery {
    #[serde(default)]
    pub from_version: u64,
}

/// Response body for rule submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddRuleResponse {
    pub rule_id: String,
    /// False if the rule was already present.
    pub added: bool,
    pub version: u64,
}

/// Request body for rule retraction.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetractRequest {
    pub rule_id: String,
    pub party: Identifier,
    /// The party's signature over the retraction message for `rule_id`.
    pub signature: String,
}

/// Response body for registry mutations.
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: u64,
}

/// Response body for job submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub plan: Option<Plan>,
}

/// Query of the asset retrieval endpoint. Exactly one requester is named.
#[derive(Debug, Deserialize)]
pub struct AssetQuery {
    /// A site asking to receive the asset.
    pub requester: Option<String>,
    /// A party asking to use the asset.
    pub party: Option<String>,
}

/// An asset handed to a party, with the conditions attached to its use.
#[derive(Debug, Serialize, Deserialize)]
pub struct PartyAssetResponse {
    pub asset: Asset,
    pub conditions: Vec<String>,
}

fn local_rules(state: &AppState) -> Result<&Arc<tessera_policy::RuleStore>, ApiError> {
    state
        .rules
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("this site does not serve policy".to_string()))
}

fn local_registry(state: &AppState) -> Result<&Arc<Registry>, ApiError> {
    state
        .registry
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("this site does not host the registry".to_string()))
}

/// Handler for `GET /rules/updates`.
pub async fn rule_updates_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<ReplicaUpdate<SignedRule>>, ApiError> {
    Ok(Json(local_rules(&state)?.get_updates_since(query.from_version)))
}

/// Handler for `GET /rules`.
pub async fn list_rules_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<SignedRule>>, ApiError> {
    Ok(Json(local_rules(&state)?.signed_rules()))
}

/// Handler for `POST /rules`.
pub async fn add_rule_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(signed): Json<SignedRule>,
) -> Result<(StatusCode, Json<AddRuleResponse>), ApiError> {
    let store = local_rules(&state)?;
    let rule_id = signed.id();
    let added = store.add(signed)?;
    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(AddRuleResponse {
            rule_id,
            added,
            version: store.version(),
        }),
    ))
}

/// Handler for `POST /rules/retract`.
///
/// The acting party proves itself by signing the retraction message with
/// the key the registry holds for it.
pub async fn retract_rule_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RetractRequest>,
) -> Result<Json<Rule>, ApiError> {
    let store = local_rules(&state)?;
    state.fresh_registry().await?;
    let party = match state.registry_client.party(&request.party) {
        Ok(party) => party,
        Err(RegistryError::NotFound(id)) => {
            return Err(ApiError::Forbidden(format!("{id} is not a registered party")))
        }
        Err(e) => return Err(e.into()),
    };
    let message = retraction_message(&request.rule_id);
    if !state
        .verifier
        .verify(&party.public_key, message.as_bytes(), &request.signature)
    {
        tracing::warn!(rule = %request.rule_id, party = %request.party, "retraction signature rejected");
        return Err(ApiError::Forbidden("invalid retraction signature".to_string()));
    }
    Ok(Json(store.retract(&request.rule_id, &request.party)?))
}

/// Handler for `GET /registry/updates`.
pub async fn registry_updates_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<ReplicaUpdate<RegisteredObject>>, ApiError> {
    Ok(Json(local_registry(&state)?.get_updates_since(query.from_version)))
}

/// Handler for `GET /registry/parties`.
pub async fn list_parties_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<PartyDescription>>, ApiError> {
    state.fresh_registry().await?;
    Ok(Json(state.registry_client.parties()?))
}

/// Handler for `POST /registry/parties`.
pub async fn register_party_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(party): Json<PartyDescription>,
) -> Result<(StatusCode, Json<VersionResponse>), ApiError> {
    let version = local_registry(&state)?.register_party(party)?;
    Ok((StatusCode::CREATED, Json(VersionResponse { version })))
}

/// Handler for `DELETE /registry/parties/{id}`.
pub async fn deregister_party_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VersionResponse>, ApiError> {
    let id = parse_id(&id)?;
    let version = local_registry(&state)?.deregister_party(&id)?;
    Ok(Json(VersionResponse { version }))
}

/// Handler for `GET /registry/sites`.
pub async fn list_sites_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<SiteDescription>>, ApiError> {
    state.fresh_registry().await?;
    Ok(Json(state.registry_client.sites()?))
}

/// Handler for `POST /registry/sites`.
pub async fn register_site_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(site): Json<SiteDescription>,
) -> Result<(StatusCode, Json<VersionResponse>), ApiError> {
    let version = local_registry(&state)?.register_site(site)?;
    Ok((StatusCode::CREATED, Json(VersionResponse { version })))
}

/// Handler for `DELETE /registry/sites/{id}`.
pub async fn deregister_site_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VersionResponse>, ApiError> {
    let id = parse_id(&id)?;
    let version = local_registry(&state)?.deregister_site(&id)?;
    Ok(Json(VersionResponse { version }))
}

/// Handler for `POST /jobs`.
pub async fn submit_job_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(job): Json<Job>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state.orchestrator.submit(job).await?;
    let plan = state.orchestrator.plan_of(job_id)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id, plan })))
}

/// Handler for `GET /jobs/{id}`.
pub async fn job_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let id = JobId::from_str(&id).map_err(|e| ApiError::BadRequest(format!("job id: {e}")))?;
    Ok(Json(state.orchestrator.poll(id)?))
}

/// Handler for `POST /execute`.
pub async fn execute_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ExecutionRequest>,
) -> Result<Json<JobResult>, ApiError> {
    Ok(Json(state.executor.execute(request).await?))
}

/// Handler for `GET /assets/{id}`.
pub async fn get_asset_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<AssetQuery>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let assets = state.executor.assets();
    match (query.requester, query.party) {
        (Some(site), None) => {
            let site = parse_id(&site)?;
            let asset = assets.retrieve_for_site(&id, &site).await?;
            tracing::info!(asset = %id, site = %site, "asset handed to site");
            Ok(Json(asset).into_response())
        }
        (None, Some(party)) => {
            let party = parse_id(&party)?;
            let (asset, conditions) = assets.retrieve_for_party(&id, &party).await?;
            tracing::info!(asset = %id, party = %party, "asset handed to party");
            Ok(Json(PartyAssetResponse { asset, conditions }).into_response())
        }
        _ => Err(ApiError::BadRequest(
            "name exactly one of 'requester' or 'party'".to_string(),
        )),
    }
}

/// Handler for `POST /assets`.
pub async fn store_asset_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(asset): Json<Asset>,
) -> Result<StatusCode, ApiError> {
    state.executor.assets().put(asset)?;
    Ok(StatusCode::CREATED)
}
