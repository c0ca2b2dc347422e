// 🌐 REST API over the stipend engine (feature "server")
//
// Identity comes from the upstream identity provider as headers:
//   x-user-id, x-user-email, x-user-role, x-user-portfolio (Lead PSM only)
//
// Every response is wrapped in ApiResponse { success, data, error }.

use crate::allocation::{Allocation, PortfolioTransfer, PracticeTransfer, SuspenseDistribution};
use crate::balance::{Balance, PortfolioSummary};
use crate::db::Event;
use crate::engine::{owner_from_parts, StipendEngine};
use crate::entities::{Portfolio, Practice, PracticeReassignment};
use crate::error::LedgerError;
use crate::ledger::{LedgerEntry, OwnerRef};
use crate::periods::{PayPeriod, PeriodRef};
use crate::reconciliation::ReconciliationReport;
use crate::remeasurement::{MetricsImportSummary, OpeningBalanceImportSummary};
use crate::workflow::{Actor, NewRequest, PeriodLine, RequestStatus, Role, StipendRequest};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StipendEngine>,
}

/// API Response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthenticated",
            message: message.into(),
        }
    }
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Validation(_) | LedgerError::Csv(_) | LedgerError::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        LedgerError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        LedgerError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        LedgerError::ConcurrencyConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Configuration(_) | LedgerError::Storage(_) | LedgerError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "request failed");
        }
        ApiError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

// ============================================================================
// IDENTITY
// ============================================================================

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let id = header_value(headers, "x-user-id")
        .ok_or_else(|| ApiError::unauthenticated("missing x-user-id header"))?;
    let email = header_value(headers, "x-user-email")
        .ok_or_else(|| ApiError::unauthenticated("missing x-user-email header"))?;
    let role = header_value(headers, "x-user-role")
        .ok_or_else(|| ApiError::unauthenticated("missing x-user-role header"))?;
    let role = Role::from_str(role).map_err(|e| ApiError::unauthenticated(e.to_string()))?;

    let mut actor = Actor::new(id, email, role);
    if let Some(portfolio) = header_value(headers, "x-user-portfolio") {
        actor = actor.in_portfolio(portfolio);
    }
    Ok(actor)
}

// ============================================================================
// QUERY & BODY SHAPES
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AsOfQuery {
    pub period: Option<u32>,
    pub year: Option<i32>,
}

impl AsOfQuery {
    fn as_of(&self) -> Result<Option<PeriodRef>, LedgerError> {
        match (self.period, self.year) {
            (Some(period), Some(year)) => Ok(Some(PeriodRef::new(period, year))),
            (None, None) => Ok(None),
            _ => Err(LedgerError::validation("period and year must be given together")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct YearQuery {
    pub year: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestFilter {
    pub practice_id: Option<String>,
    pub status: Option<String>,
}

impl RequestFilter {
    fn status(&self) -> Result<Option<RequestStatus>, LedgerError> {
        self.status.as_deref().map(RequestStatus::from_str).transpose()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PortfolioFilter {
    pub portfolio_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewPortfolioBody {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct NewPracticeBody {
    pub id: String,
    pub name: String,
    pub portfolio_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReassignBody {
    pub portfolio_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ActiveBody {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeedYearBody {
    pub year: i32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct SuspenseResponse {
    pub portfolio_id: String,
    pub suspense_balance: Decimal,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

async fn get_current_period(State(state): State<AppState>) -> ApiResult<PayPeriod> {
    ok(state.engine.current_period()?)
}

async fn set_current_period(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(period): Json<PeriodRef>,
) -> ApiResult<PayPeriod> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.set_current_period(&actor, period)?)
}

async fn seed_year(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SeedYearBody>,
) -> ApiResult<usize> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.seed_year(&actor, body.year)?)
}

async fn list_portfolios(State(state): State<AppState>) -> ApiResult<Vec<Portfolio>> {
    ok(state.engine.portfolios()?)
}

async fn create_portfolio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewPortfolioBody>,
) -> ApiResult<Portfolio> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.create_portfolio(&actor, &body.id, &body.name)?)
}

async fn set_portfolio_active(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ActiveBody>,
) -> ApiResult<Portfolio> {
    let actor = actor_from_headers(&headers)?;
    state.engine.set_portfolio_active(&actor, &id, body.active)?;
    ok(state.engine.portfolio(&id)?)
}

async fn portfolio_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AsOfQuery>,
) -> ApiResult<PortfolioSummary> {
    ok(state.engine.portfolio_summary(&id, query.as_of()?)?)
}

async fn portfolio_suspense(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SuspenseResponse> {
    state.engine.portfolio(&id)?;
    let suspense_balance = state.engine.suspense_balance(&id)?;
    ok(SuspenseResponse {
        portfolio_id: id,
        suspense_balance,
    })
}

async fn list_practices(
    State(state): State<AppState>,
    Query(filter): Query<PortfolioFilter>,
) -> ApiResult<Vec<Practice>> {
    ok(state.engine.practices(filter.portfolio_id.as_deref())?)
}

async fn create_practice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewPracticeBody>,
) -> ApiResult<Practice> {
    let actor = actor_from_headers(&headers)?;
    ok(state
        .engine
        .create_practice(&actor, &body.id, &body.name, &body.portfolio_id)?)
}

async fn get_practice(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Practice> {
    ok(state.engine.practice(&id)?)
}

async fn set_practice_active(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ActiveBody>,
) -> ApiResult<Practice> {
    let actor = actor_from_headers(&headers)?;
    state.engine.set_practice_active(&actor, &id, body.active)?;
    ok(state.engine.practice(&id)?)
}

async fn reassign_practice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ReassignBody>,
) -> ApiResult<PracticeReassignment> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.reassign_practice(&actor, &id, &body.portfolio_id)?)
}

/// GET /api/practices/:id/balance?period=&year=
async fn practice_balance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AsOfQuery>,
) -> ApiResult<Balance> {
    ok(state.engine.balance(&id, query.as_of()?)?)
}

async fn practice_ledger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<YearQuery>,
) -> ApiResult<Vec<LedgerEntry>> {
    state.engine.practice(&id)?;
    ok(state.engine.ledger_entries(&OwnerRef::Practice(id), query.year)?)
}

async fn list_requests(
    State(state): State<AppState>,
    Query(filter): Query<RequestFilter>,
) -> ApiResult<Vec<StipendRequest>> {
    ok(state
        .engine
        .requests(filter.practice_id.as_deref(), filter.status()?)?)
}

async fn submit_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewRequest>,
) -> Result<(StatusCode, Json<ApiResponse<StipendRequest>>), ApiError> {
    let actor = actor_from_headers(&headers)?;
    let request = state.engine.submit_request(&actor, &body)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(request))))
}

async fn get_request(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StipendRequest> {
    ok(state.engine.request(&id)?)
}

async fn delete_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<String> {
    let actor = actor_from_headers(&headers)?;
    state.engine.delete_request(&actor, &id)?;
    ok(id)
}

async fn approve_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> ApiResult<StipendRequest> {
    let actor = actor_from_headers(&headers)?;
    let comment = body.and_then(|Json(b)| b.comment);
    ok(state.engine.approve_request(&actor, &id, comment.as_deref())?)
}

async fn reject_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> ApiResult<StipendRequest> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.reject_request(&actor, &id, &body.reason)?)
}

async fn request_periods(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<PeriodLine>> {
    ok(state.engine.request_period_lines(&id)?)
}

async fn cancel_period(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(period): Json<PeriodRef>,
) -> ApiResult<PeriodLine> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.cancel_period(&actor, &id, period)?)
}

async fn mark_period_paid(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(period): Json<PeriodRef>,
) -> ApiResult<PeriodLine> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.mark_period_paid(&actor, &id, period)?)
}

async fn list_allocations(State(state): State<AppState>) -> ApiResult<Vec<Allocation>> {
    ok(state.engine.allocations()?)
}

async fn get_allocation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Allocation> {
    ok(state.engine.allocation(&id)?)
}

async fn reconcile_allocation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ReconciliationReport> {
    ok(state.engine.reconcile_allocation(&id)?)
}

async fn reconcile_owner(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Query(query): Query<AsOfQuery>,
) -> ApiResult<ReconciliationReport> {
    let owner = owner_from_parts(&kind, &id)?;
    ok(state.engine.reconcile_owner(&owner, query.as_of()?)?)
}

async fn allocate_practices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PracticeTransfer>,
) -> ApiResult<Allocation> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.allocate_practice_to_practice(&actor, &body)?)
}

async fn allocate_portfolio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PortfolioTransfer>,
) -> ApiResult<Allocation> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.allocate_inter_portfolio(&actor, &body)?)
}

async fn distribute_suspense(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SuspenseDistribution>,
) -> ApiResult<Allocation> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.distribute_suspense(&actor, &body)?)
}

/// POST /api/imports/metrics (text/csv body)
async fn import_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<MetricsImportSummary> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.import_metrics_csv(&actor, body.as_bytes())?)
}

async fn import_opening_balances(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<OpeningBalanceImportSummary> {
    let actor = actor_from_headers(&headers)?;
    ok(state.engine.import_opening_balances_csv(&actor, body.as_bytes())?)
}

async fn entity_events(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> ApiResult<Vec<Event>> {
    ok(state.engine.events_for(&entity_type, &entity_id)?)
}

fn csv_response(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response()
}

/// GET /api/export/ledger?year= (CSV)
async fn export_ledger(
    State(state): State<AppState>,
    Query(query): Query<YearQuery>,
) -> Result<Response, ApiError> {
    let mut out = Vec::new();
    state.engine.export_ledger(&mut out, query.year)?;
    Ok(csv_response(out))
}

async fn export_requests(
    State(state): State<AppState>,
    Query(filter): Query<RequestFilter>,
) -> Result<Response, ApiError> {
    let mut out = Vec::new();
    state
        .engine
        .export_requests(&mut out, filter.practice_id.as_deref(), filter.status()?)?;
    Ok(csv_response(out))
}

// ============================================================================
// ROUTER
// ============================================================================

/// All JSON routes, nested under /api
pub fn router(engine: Arc<StipendEngine>) -> Router {
    let state = AppState { engine };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/periods/current", get(get_current_period).post(set_current_period))
        .route("/periods/seed", post(seed_year))
        .route("/portfolios", get(list_portfolios).post(create_portfolio))
        .route("/portfolios/:id/active", post(set_portfolio_active))
        .route("/portfolios/:id/summary", get(portfolio_summary))
        .route("/portfolios/:id/suspense", get(portfolio_suspense))
        .route("/practices", get(list_practices).post(create_practice))
        .route("/practices/:id", get(get_practice))
        .route("/practices/:id/active", post(set_practice_active))
        .route("/practices/:id/reassign", post(reassign_practice))
        .route("/practices/:id/balance", get(practice_balance))
        .route("/practices/:id/ledger", get(practice_ledger))
        .route("/requests", get(list_requests).post(submit_request))
        .route("/requests/:id", get(get_request).delete(delete_request))
        .route("/requests/:id/approve", post(approve_request))
        .route("/requests/:id/reject", post(reject_request))
        .route("/requests/:id/periods", get(request_periods))
        .route("/requests/:id/periods/cancel", post(cancel_period))
        .route("/requests/:id/periods/paid", post(mark_period_paid))
        .route("/allocations", get(list_allocations))
        .route("/allocations/practices", post(allocate_practices))
        .route("/allocations/portfolio", post(allocate_portfolio))
        .route("/allocations/suspense", post(distribute_suspense))
        .route("/allocations/:id", get(get_allocation))
        .route("/allocations/:id/reconcile", get(reconcile_allocation))
        .route("/reconcile/:kind/:id", get(reconcile_owner))
        .route("/imports/metrics", post(import_metrics))
        .route("/imports/opening-balances", post(import_opening_balances))
        .route("/events/:entity_type/:entity_id", get(entity_events))
        .route("/export/ledger", get(export_ledger))
        .route("/export/requests", get(export_requests))
        .with_state(state);

    Router::new().nest("/api", api_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_engine;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(seeded_engine()))
    }

    fn with_identity(builder: axum::http::request::Builder, role: &str) -> axum::http::request::Builder {
        builder
            .header("x-user-id", format!("u-{}", role))
            .header("x-user-email", format!("{}@example.com", role))
            .header("x-user-role", role)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, role: &str, body: Value) -> Request<Body> {
        with_identity(Request::post(uri), role)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = send(&app, Request::get("/api/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let app = app();
        let request = Request::post("/api/periods/seed")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "year": 2027 }).to_string()))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_import_then_balance() {
        let app = app();
        let csv = "Practice ID,Pay Period,Year,Stipend Cap\nP-1,PP1,2025,\"$4,000.00\"\n";
        let request = with_identity(Request::post("/api/imports/metrics"), "admin")
            .header(header::CONTENT_TYPE, "text/csv")
            .body(Body::from(csv))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["opening_balances"], 1);

        let (status, body) = send(
            &app,
            Request::get("/api/practices/P-1/balance").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["available_balance"], "4000");
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let app = app();

        let (status, body) = send(
            &app,
            Request::get("/api/practices/P-404/balance").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let (status, _) = send(
            &app,
            Request::get("/api/practices/P-1/balance?period=3").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // No cap yet: any request exceeds the available balance
        let new_request = json!({
            "practice_id": "P-1",
            "amount": "500",
            "request_type": "one_time",
            "category": "recruitment",
            "description": "Signing bonus",
            "justification": "Open provider slot",
            "effective_period": { "period": 2, "year": 2025 }
        });
        let (status, body) = send(&app, post_json("/api/requests", "psm", new_request)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "insufficient_balance");

        let (status, _) = send(
            &app,
            post_json("/api/periods/current", "psm", json!({ "period": 2, "year": 2025 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_request_lifecycle_over_http() {
        let app = app();
        let csv = "practice_id,pay_period,year,stipend_cap\nP-1,1,2025,2000\n";
        let import = with_identity(Request::post("/api/imports/metrics"), "finance")
            .body(Body::from(csv))
            .unwrap();
        assert_eq!(send(&app, import).await.0, StatusCode::OK);

        let new_request = json!({
            "practice_id": "P-1",
            "amount": "500",
            "request_type": "one_time",
            "category": "recruitment",
            "description": "Signing bonus",
            "justification": "Open provider slot",
            "effective_period": { "period": 2, "year": 2025 }
        });
        let (status, body) = send(&app, post_json("/api/requests", "psm", new_request)).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (_, body) = send(&app, post_json(&format!("/api/requests/{}/approve", id), "psm", json!({}))).await;
        assert_eq!(body["data"]["status"], "pending_lead_psm");

        // Finance may not skip the Lead PSM gate
        let (status, body) = send(&app, post_json(&format!("/api/requests/{}/approve", id), "finance", json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_state_transition");

        let lead = with_identity(Request::post(format!("/api/requests/{}/approve", id)), "lead_psm")
            .header("x-user-portfolio", "PF-A")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (_, body) = send(&app, lead).await;
        assert_eq!(body["data"]["status"], "pending_finance");

        let (_, body) = send(
            &app,
            post_json(&format!("/api/requests/{}/approve", id), "finance", json!({ "comment": "Approved for payroll" })),
        )
        .await;
        assert_eq!(body["data"]["status"], "approved");

        let (_, body) = send(
            &app,
            Request::get(format!("/api/requests/{}/periods", id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body["data"][0]["status"], "committed");

        let (status, _) = send(
            &app,
            post_json(
                &format!("/api/requests/{}/periods/paid", id),
                "finance",
                json!({ "period": 2, "year": 2025 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/api/export/ledger?year=2025").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("committed"));
        assert!(text.contains("paid"));
    }
}
