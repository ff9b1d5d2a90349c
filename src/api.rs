//! REST API for the parcel consolidation service.
//!
//! Provides HTTP endpoints for quoting carts. Optimizations run on a
//! blocking worker so long searches never stall the server. Uses Axum as
//! the web framework and supports CORS.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Router,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use utoipa::{OpenApi, ToSchema};

use crate::compaction::CompactionState;
use crate::config::{ApiConfig, OptimizerSettings};
use crate::error::OptimizationError;
use crate::gate::{Confirm, ConfirmationRequest, GateState, confirmation_channel};
use crate::model::{Cart, Item, ValidationError};
use crate::optimizer::{
    CompactionSummary, OptimizationResult, OptimizeEvent, OptimizerConfig, ParcelGroup,
    optimize_with_config, optimize_with_progress,
};
use crate::partition::{SearchMode, SearchStats};
use crate::tariff::{TariffEntry, TariffRates};

#[derive(Clone)]
struct ApiState {
    settings: OptimizerSettings,
    tariff: Arc<TariffRates>,
    confirmations: Arc<PendingConfirmations>,
}

/// Confirmation questions of streamed quotes that wait for an answer.
#[derive(Default)]
struct PendingConfirmations {
    next_ticket: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<bool>>>,
}

impl PendingConfirmations {
    fn register(&self, answer: oneshot::Sender<bool>) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticket, answer);
        ticket
    }

    /// Delivers an answer; `false` if the ticket is unknown or expired.
    fn resolve(&self, ticket: u64, proceed: bool) -> bool {
        let answer = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ticket);
        match answer {
            Some(answer) => answer.send(proceed).is_ok(),
            None => false,
        }
    }

    fn forget(&self, ticket: u64) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ticket);
    }

    fn len(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

static OPENAPI_DOC: OnceLock<utoipa::openapi::OpenApi> = OnceLock::new();

// SRI hashes verified against https://unpkg.com/swagger-ui-dist@5.17.14/ on 2025-10-29.
const SWAGGER_UI_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
    <head>
        <meta charset="utf-8" />
        <title>parcel-optimizer API Docs</title>
        <link
            rel="stylesheet"
            href="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui.css"
            integrity="sha384-wxLW6kwyHktdDGr6Pv1zgm/VGJh99lfUbzSn6HNHBENZlCN7W602k9VkGdxuFvPn"
            crossorigin="anonymous"
        />
    </head>
    <body>
        <div id="swagger-ui"></div>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-bundle.js"
            integrity="sha384-wmyclcVGX/WhUkdkATwhaK1X1JtiNrr2EoYJ+diV3vj4v6OC5yCeSu+yW13SYJep"
            crossorigin="anonymous"
        ></script>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-standalone-preset.js"
            integrity="sha384-2YH8WDRaj7V2OqU/trsmzSagmk/E2SutiCsGkdgoQwC9pNUJV1u/141DHB6jgs8t"
            crossorigin="anonymous"
        ></script>
        <script>
            window.onload = function () {
                const ui = SwaggerUIBundle({
                    url: "/docs/openapi.json",
                    dom_id: "#swagger-ui",
                    presets: [SwaggerUIBundle.presets.apis, SwaggerUIStandalonePreset],
                    layout: "StandaloneLayout",
                });
                window.ui = ui;
            };
        </script>
    </body>
    </html>"##;

fn openapi_doc() -> &'static utoipa::openapi::OpenApi {
    OPENAPI_DOC.get_or_init(ApiDoc::openapi)
}

/// Request structure for the quote endpoints.
///
/// Every field except `items` is optional and falls back to the service
/// configuration.
#[derive(Deserialize, ToSchema)]
#[schema(
    example = json!({
        "items": [
            { "id": "lamp", "mass": 14.0 },
            { "id": "desk", "mass": 14.0 },
            { "id": "screws", "mass": 3.0 },
            { "id": "chair", "mass": 12.0 }
        ],
        "max_parcel_mass": 30.0,
        "confirm_large_search": true
    })
)]
pub struct QuoteRequest {
    pub items: Vec<Item>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub max_parcel_mass: Option<f64>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub warning_threshold: Option<u64>,
    /// Answer to give if the search needs confirmation
    #[serde(default)]
    #[schema(nullable = true)]
    pub confirm_large_search: Option<bool>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub search_mode: Option<SearchMode>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub parallel_search: Option<bool>,
}

#[derive(Debug)]
struct ValidatedQuoteRequest {
    cart: Cart,
    config: OptimizerConfig,
    confirm_large_search: Option<bool>,
}

#[derive(Debug)]
enum QuoteRequestValidationError {
    InvalidItem(ValidationError),
    InvalidMaxParcelMass(f64),
    MaxParcelMassAboveCeiling { requested: f64, ceiling: f64 },
    InvalidWarningThreshold,
}

impl std::fmt::Display for QuoteRequestValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuoteRequestValidationError::InvalidItem(err) => write!(f, "{err}"),
            QuoteRequestValidationError::InvalidMaxParcelMass(value) => write!(
                f,
                "max_parcel_mass must be a positive finite number, got: {value}"
            ),
            QuoteRequestValidationError::MaxParcelMassAboveCeiling { requested, ceiling } => {
                write!(
                    f,
                    "max_parcel_mass may not exceed {ceiling}, got: {requested}"
                )
            }
            QuoteRequestValidationError::InvalidWarningThreshold => {
                write!(f, "warning_threshold must be greater than 0")
            }
        }
    }
}

impl QuoteRequest {
    fn into_validated(
        self,
        defaults: OptimizerConfig,
    ) -> Result<ValidatedQuoteRequest, QuoteRequestValidationError> {
        let cart =
            Cart::from_items(self.items).map_err(QuoteRequestValidationError::InvalidItem)?;

        let mut config = defaults;
        if let Some(mass) = self.max_parcel_mass {
            if !(mass.is_finite() && mass > 0.0) {
                return Err(QuoteRequestValidationError::InvalidMaxParcelMass(mass));
            }
            // compaction retries scale with the ceiling
            if mass > defaults.max_parcel_mass {
                return Err(QuoteRequestValidationError::MaxParcelMassAboveCeiling {
                    requested: mass,
                    ceiling: defaults.max_parcel_mass,
                });
            }
            config.max_parcel_mass = mass;
        }
        if let Some(threshold) = self.warning_threshold {
            if threshold == 0 {
                return Err(QuoteRequestValidationError::InvalidWarningThreshold);
            }
            config.warning_threshold = u128::from(threshold);
        }
        if let Some(mode) = self.search_mode {
            config.search_mode = mode;
        }
        if let Some(parallel) = self.parallel_search {
            config.parallel_search = parallel;
        }

        Ok(ValidatedQuoteRequest {
            cart,
            config,
            confirm_large_search: self.confirm_large_search,
        })
    }
}

/// Outcome of a quote.
///
/// A declined confirmation is a regular answer, not an error.
#[derive(Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuoteResponse {
    Completed {
        total_price: f64,
        total_mass: f64,
        parcels: Vec<ParcelGroup>,
        stats: SearchStats,
        compaction: Option<CompactionSummary>,
    },
    Aborted {
        message: String,
        partitions: u64,
    },
}

impl From<OptimizationResult> for QuoteResponse {
    fn from(result: OptimizationResult) -> Self {
        let total_mass = result.total_mass();
        QuoteResponse::Completed {
            total_price: result.total_price,
            total_mass,
            parcels: result.groups,
            stats: result.stats,
            compaction: result.compaction,
        }
    }
}

/// Answer to a pending confirmation of a streamed quote.
#[derive(Deserialize, ToSchema)]
#[schema(example = json!({ "proceed": true }))]
pub struct ConfirmationAnswer {
    pub proceed: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ConfirmationAck {
    pub ticket: u64,
    pub proceed: bool,
}

/// Stream message telling the client which ticket to answer.
#[derive(Serialize, ToSchema)]
#[serde(tag = "type")]
pub enum ConfirmationNotice {
    AwaitingConfirmation {
        ticket: u64,
        message: String,
        state: GateState,
    },
}

/// Active tariff.
#[derive(Serialize, ToSchema)]
pub struct TariffResponse {
    pub max_parcel_mass: f64,
    pub entries: Vec<TariffEntry>,
    pub compaction: CompactionState,
}

#[derive(Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
    code: String,
    details: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: details.into(),
        }
    }
}

fn error_response(
    status: StatusCode,
    error: impl Into<String>,
    code: impl Into<String>,
    details: impl Into<String>,
) -> Response {
    (status, Json(ErrorResponse::new(error, code, details))).into_response()
}

fn json_deserialize_error(err: JsonRejection) -> Response {
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Invalid JSON data",
        "invalid_json",
        err.to_string(),
    )
}

fn validation_error(details: impl Into<String>) -> Response {
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Invalid input data",
        "invalid_input",
        details,
    )
}

/// HTTP status and body for a failed or declined optimization.
fn optimization_error_body(err: &OptimizationError) -> (StatusCode, serde_json::Value) {
    if let OptimizationError::SearchAborted { partitions } = err {
        let body = QuoteResponse::Aborted {
            message: err.to_string(),
            partitions: u64::try_from(*partitions).unwrap_or(u64::MAX),
        };
        return (StatusCode::OK, serde_json::to_value(body).unwrap_or_default());
    }

    let (status, title) = match err {
        OptimizationError::InvalidTariff(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Invalid tariff configuration")
        }
        OptimizationError::LabelMismatch(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal optimizer error")
        }
        OptimizationError::EmptyInput => (StatusCode::UNPROCESSABLE_ENTITY, "Empty cart"),
        OptimizationError::ExcessiveItemMass { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "Item too heavy")
        }
        OptimizationError::CannotCompact { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "Cart too large")
        }
        OptimizationError::SearchAborted { .. } => (StatusCode::OK, "Search declined"),
    };
    let body = ErrorResponse::new(title, err.code(), err.to_string());
    (status, serde_json::to_value(body).unwrap_or_default())
}

fn quote_body(
    outcome: Result<OptimizationResult, OptimizationError>,
) -> (StatusCode, serde_json::Value) {
    match outcome {
        Ok(result) => {
            info!(
                parcels = result.parcel_count(),
                total_price = result.total_price,
                "quote completed"
            );
            let body = QuoteResponse::from(result);
            (StatusCode::OK, serde_json::to_value(body).unwrap_or_default())
        }
        Err(err) => {
            if err.is_cancellation() {
                info!(%err, "quote aborted");
            } else if err.is_defect() {
                error!(%err, "quote failed");
            } else {
                warn!(%err, "quote rejected");
            }
            optimization_error_body(&err)
        }
    }
}

fn parse_quote_request(
    payload: Result<Json<QuoteRequest>, JsonRejection>,
    defaults: OptimizerConfig,
) -> Result<ValidatedQuoteRequest, Response> {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(err) => return Err(json_deserialize_error(err)),
    };

    payload
        .into_validated(defaults)
        .map_err(|err| validation_error(err.to_string()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handle_quote,
        handle_quote_stream,
        handle_confirmation,
        handle_tariff
    ),
    components(
        schemas(
            QuoteRequest,
            QuoteResponse,
            ConfirmationAnswer,
            ConfirmationAck,
            ConfirmationNotice,
            TariffResponse,
            ErrorResponse,
            Item,
            ParcelGroup,
            CompactionSummary,
            CompactionState,
            SearchStats,
            SearchMode,
            GateState,
            TariffEntry,
            OptimizeEvent
        )
    ),
    tags((name = "quotes", description = "Endpoints for parcel consolidation quotes"))
)]
struct ApiDoc;

fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        // API endpoints
        .route("/quote", post(handle_quote))
        .route("/quote_stream", post(handle_quote_stream))
        .route("/confirmations/{ticket}", post(handle_confirmation))
        .route("/tariff", get(handle_tariff))
        // API documentation
        .route("/docs/openapi.json", get(serve_openapi_json))
        .route("/docs", get(serve_openapi_ui))
        .layer(cors)
        .with_state(state)
}

/// Starts the API server.
///
/// Configures CORS for cross-origin requests. Runs until the server is
/// terminated.
pub async fn start_api_server(
    config: ApiConfig,
    settings: OptimizerSettings,
    tariff: TariffRates,
) -> std::io::Result<()> {
    let state = ApiState {
        settings,
        tariff: Arc::new(tariff),
        confirmations: Arc::new(PendingConfirmations::default()),
    };
    let app = build_router(state);

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        "Server running on http://{}:{}",
        config.display_host(),
        config.port()
    );
    if config.binds_to_all_interfaces() {
        info!("Local access: http://localhost:{}", config.port());
    }
    info!("API endpoints: POST /quote, POST /quote_stream, POST /confirmations/{{ticket}}, GET /tariff");
    info!("Documentation: GET /docs, GET /docs/openapi.json");

    axum::serve(listener, app).await
}

/// Handler for POST /quote endpoint.
///
/// Computes the cheapest consolidation of the cart. Large searches are
/// answered by `confirm_large_search`, or by the service default when the
/// field is absent.
#[utoipa::path(
    post,
    path = "/quote",
    request_body = QuoteRequest,
    responses(
        (status = 200, description = "Completed or declined quote", body = QuoteResponse),
        (
            status = UNPROCESSABLE_ENTITY,
            description = "Invalid request, oversized item or untractable cart",
            body = ErrorResponse
        ),
        (
            status = INTERNAL_SERVER_ERROR,
            description = "Tariff misconfiguration or internal defect",
            body = ErrorResponse
        )
    ),
    tag = "quotes"
)]
async fn handle_quote(
    State(state): State<ApiState>,
    payload: Result<Json<QuoteRequest>, JsonRejection>,
) -> Response {
    let request = match parse_quote_request(payload, state.settings.optimizer_config()) {
        Ok(request) => request,
        Err(response) => return response,
    };

    info!(
        items = request.cart.len(),
        total_mass = request.cart.total_mass(),
        "new quote request"
    );
    if let Some(heaviest) = request.cart.heaviest() {
        debug!(label = %heaviest.id, mass = heaviest.mass, "heaviest item");
    }

    let tariff = match state.tariff.table(request.config.max_parcel_mass) {
        Ok(tariff) => tariff,
        Err(err) => {
            let (status, body) = optimization_error_body(&err.into());
            return (status, Json(body)).into_response();
        }
    };
    let answer = request
        .confirm_large_search
        .unwrap_or_else(|| state.settings.auto_confirm());
    let ValidatedQuoteRequest { cart, config, .. } = request;

    let outcome = tokio::task::spawn_blocking(move || {
        let confirm = move |_: &str| answer;
        optimize_with_config(&cart, &tariff, config, &confirm)
    })
    .await;

    match outcome {
        Ok(outcome) => {
            let (status, body) = quote_body(outcome);
            (status, Json(body)).into_response()
        }
        Err(err) => {
            error!(%err, "optimizer worker crashed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal optimizer error",
                "worker_failed",
                err.to_string(),
            )
        }
    }
}

/// Handler for POST /quote_stream endpoint (SSE).
///
/// Streams optimizer events in real-time as Server-Sent Events. If the
/// search needs confirmation and the request carries no answer, an
/// `AwaitingConfirmation` message names the ticket to answer via
/// `POST /confirmations/{ticket}`. The last message is a `result` event
/// carrying the same body as `POST /quote`. Closing the stream declines
/// any pending confirmation.
#[utoipa::path(
    post,
    path = "/quote_stream",
    request_body = QuoteRequest,
    responses(
        (
            status = 200,
            description = "Streams optimizer events in real-time",
            content_type = "text/event-stream",
            body = String
        ),
        (
            status = UNPROCESSABLE_ENTITY,
            description = "Invalid request",
            body = ErrorResponse
        )
    ),
    tag = "quotes"
)]
async fn handle_quote_stream(
    State(state): State<ApiState>,
    payload: Result<Json<QuoteRequest>, JsonRejection>,
) -> Response {
    let request = match parse_quote_request(payload, state.settings.optimizer_config()) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let tariff = match state.tariff.table(request.config.max_parcel_mass) {
        Ok(tariff) => tariff,
        Err(err) => {
            let (status, body) = optimization_error_body(&err.into());
            return (status, Json(body)).into_response();
        }
    };

    info!(items = request.cart.len(), "new streamed quote request");

    let (tx, rx) = mpsc::channel::<Event>(32);

    let confirm: Box<dyn Confirm + Send> = match request.confirm_large_search {
        Some(answer) => Box::new(move |_: &str| answer),
        None => {
            let (confirm, requests) = confirmation_channel();
            tokio::spawn(forward_confirmations(
                requests,
                tx.clone(),
                state.confirmations.clone(),
            ));
            Box::new(confirm)
        }
    };

    let ValidatedQuoteRequest { cart, config, .. } = request;
    tokio::task::spawn_blocking(move || {
        let outcome = optimize_with_progress(&cart, &tariff, config, &*confirm, |evt| {
            if let Ok(json) = serde_json::to_string(evt) {
                // a closed receiver only means the client went away
                let _ = tx.blocking_send(Event::default().data(json));
            }
        });
        let (_, body) = quote_body(outcome);
        let _ = tx.blocking_send(Event::default().event("result").data(body.to_string()));
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(10))
                .text("keep-alive"),
        )
        .into_response()
}

/// Publishes each confirmation question of one stream under a ticket and
/// relays the answer to the worker.
async fn forward_confirmations(
    mut requests: mpsc::UnboundedReceiver<ConfirmationRequest>,
    events: mpsc::Sender<Event>,
    confirmations: Arc<PendingConfirmations>,
) {
    while let Some(ConfirmationRequest { message, reply }) = requests.recv().await {
        let (answer_tx, answer_rx) = oneshot::channel();
        let ticket = confirmations.register(answer_tx);
        let notice = ConfirmationNotice::AwaitingConfirmation {
            ticket,
            message,
            state: GateState::AwaitingConfirmation,
        };
        let Ok(json) = serde_json::to_string(&notice) else {
            confirmations.forget(ticket);
            continue;
        };
        if events.send(Event::default().data(json)).await.is_err() {
            confirmations.forget(ticket);
            break;
        }
        debug!(
            ticket,
            pending = confirmations.len(),
            "waiting for confirmation"
        );

        tokio::select! {
            answer = answer_rx => {
                let proceed = answer.unwrap_or(false);
                info!(ticket, proceed, "confirmation answered");
                let _ = reply.send(proceed);
            }
            _ = events.closed() => {
                // dropping `reply` declines the search
                info!(ticket, "stream closed while awaiting confirmation");
                confirmations.forget(ticket);
                break;
            }
        }
    }
}

/// Handler for POST /confirmations/{ticket} endpoint.
///
/// Answers a pending confirmation of a streamed quote.
#[utoipa::path(
    post,
    path = "/confirmations/{ticket}",
    params(("ticket" = u64, Path, description = "Ticket from the AwaitingConfirmation message")),
    request_body = ConfirmationAnswer,
    responses(
        (status = 200, description = "Answer delivered", body = ConfirmationAck),
        (status = NOT_FOUND, description = "Unknown or expired ticket", body = ErrorResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "quotes"
)]
async fn handle_confirmation(
    State(state): State<ApiState>,
    Path(ticket): Path<u64>,
    payload: Result<Json<ConfirmationAnswer>, JsonRejection>,
) -> Response {
    let Json(answer) = match payload {
        Ok(answer) => answer,
        Err(err) => return json_deserialize_error(err),
    };

    if state.confirmations.resolve(ticket, answer.proceed) {
        let ack = ConfirmationAck {
            ticket,
            proceed: answer.proceed,
        };
        (StatusCode::OK, Json(ack)).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "Unknown confirmation ticket",
            "unknown_ticket",
            format!("no pending confirmation with ticket {ticket}"),
        )
    }
}

/// Handler for GET /tariff endpoint.
#[utoipa::path(
    get,
    path = "/tariff",
    responses(
        (status = 200, description = "Active tariff", body = TariffResponse),
        (status = INTERNAL_SERVER_ERROR, description = "Invalid tariff configuration", body = ErrorResponse)
    ),
    tag = "quotes"
)]
async fn handle_tariff(State(state): State<ApiState>) -> Response {
    let config = state.settings.optimizer_config();
    match state.tariff.table(config.max_parcel_mass) {
        Ok(table) => {
            let body = TariffResponse {
                max_parcel_mass: table.max_parcel_mass(),
                entries: table.entries().to_vec(),
                compaction: CompactionState {
                    light_item_threshold: config.light_item_threshold,
                    compaction_group_capacity: config.compaction_group_capacity,
                },
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            let (status, body) = optimization_error_body(&err.into());
            (status, Json(body)).into_response()
        }
    }
}

async fn serve_openapi_json(State(_state): State<ApiState>) -> impl IntoResponse {
    Json(openapi_doc())
}

async fn serve_openapi_ui(State(_state): State<ApiState>) -> impl IntoResponse {
    Html(SWAGGER_UI_HTML)
}
