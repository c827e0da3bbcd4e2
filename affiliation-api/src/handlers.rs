use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use affiliation_common::affiliation::{
    AffiliationClaim, ClaimOrigin, TenantScope, ValidationError, TENANT_HEADER,
};
use affiliation_common::ingest::{AffiliationIngestionService, Outcome};
use affiliation_common::predicate::{FilterField, PredicateBuilder, PredicateError, QueryOp};
use affiliation_common::store::AffiliationPage;

/// Enumeration of errors surfaced by the affiliation endpoints. Each
/// outcome category maps to a distinct response class so callers can tell
/// "already exists, nothing to do" from "genuinely broken".
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing required 'tenant-id' header")]
    MissingTenantScope,

    #[error("{0}")]
    InvalidQuery(#[from] PredicateError),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("affiliation conflicts with existing record {existing_id}")]
    Conflict { existing_id: Uuid },

    #[error("storage is temporarily unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingTenantScope | ApiError::InvalidQuery(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            ApiError::Validation(_) | ApiError::Conflict { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }

            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AffiliationQuery {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub tenant_id: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub mobile_phone_number: Option<String>,
    pub barcode: Option<String>,
    pub external_system_id: Option<String>,
    pub query_op: Option<String>,
    pub offset: u32,
    pub limit: u32,
}

impl Default for AffiliationQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            username: None,
            tenant_id: None,
            email: None,
            phone_number: None,
            mobile_phone_number: None,
            barcode: None,
            external_system_id: None,
            query_op: None,
            offset: 0,
            limit: 10,
        }
    }
}

pub fn add_routes(
    router: Router<Arc<AffiliationIngestionService>>,
    service: Arc<AffiliationIngestionService>,
) -> Router {
    router
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route(
            "/affiliations",
            get(get_affiliations)
                .post(post_affiliation)
                .delete(delete_affiliations),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn index() -> &'static str {
    "affiliation api"
}

/// The scope is taken from the request header at the edge and threaded
/// explicitly through every call below; nothing reads it ambiently.
fn tenant_scope(headers: &HeaderMap) -> Result<TenantScope, ApiError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(TenantScope::new)
        .ok_or(ApiError::MissingTenantScope)
}

async fn get_affiliations(
    State(service): State<Arc<AffiliationIngestionService>>,
    headers: HeaderMap,
    Query(params): Query<AffiliationQuery>,
) -> Result<Json<AffiliationPage>, ApiError> {
    let scope = tenant_scope(&headers)?;

    let op = match params.query_op.as_deref() {
        None => QueryOp::default(),
        Some(raw) => raw.parse()?,
    };
    let predicate = PredicateBuilder::new(op)
        .field(FilterField::UserId, params.user_id.as_deref())
        .field(FilterField::Username, params.username.as_deref())
        .field(FilterField::TenantId, params.tenant_id.as_deref())
        .field(FilterField::Email, params.email.as_deref())
        .field(FilterField::PhoneNumber, params.phone_number.as_deref())
        .field(
            FilterField::MobilePhoneNumber,
            params.mobile_phone_number.as_deref(),
        )
        .field(FilterField::Barcode, params.barcode.as_deref())
        .field(
            FilterField::ExternalSystemId,
            params.external_system_id.as_deref(),
        )
        .build();

    tracing::debug!(scope = %scope, ?predicate, "querying affiliations");

    let page = service
        .query_affiliations(
            &scope,
            &predicate,
            i64::from(params.offset),
            i64::from(params.limit),
        )
        .await
        .map_err(|error| ApiError::Unavailable(error.to_string()))?;

    Ok(Json(page))
}

async fn post_affiliation(
    State(service): State<Arc<AffiliationIngestionService>>,
    headers: HeaderMap,
    Json(claim): Json<AffiliationClaim>,
) -> Result<Response, ApiError> {
    let scope = tenant_scope(&headers)?;

    match service.ingest(&scope, claim, ClaimOrigin::Api).await? {
        Outcome::Created(record) => Ok((StatusCode::CREATED, Json(record)).into_response()),
        Outcome::AlreadyProcessed { id } => {
            Ok((StatusCode::OK, Json(serde_json::json!({ "id": id }))).into_response())
        }
        Outcome::Rejected { existing_id, .. } => Err(ApiError::Conflict { existing_id }),
        Outcome::Transient { reason } => Err(ApiError::Unavailable(reason)),
    }
}

async fn delete_affiliations(
    State(service): State<Arc<AffiliationIngestionService>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let scope = tenant_scope(&headers)?;

    service
        .revoke_membership(&scope)
        .await
        .map_err(|error| ApiError::Unavailable(error.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}
