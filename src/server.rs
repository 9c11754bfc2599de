use crate::config::GatewayConfig;
use crate::cost::{CostAccountant, UsageData};
use crate::ledger::{LedgerEntry, PriceStore, RequestLedger};
use crate::logging::SharedLogger;
use crate::proxy::{stream_headers, Exchange, Forwarder, Gateway, ProxyOutcome};
use crate::tokens::{Encoding, TokenCounter};
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_PAGE_SIZE: u64 = 10;
const MAX_PAGE_SIZE: u64 = 100;
const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub gateway: Gateway,
    pub ledger: Arc<dyn RequestLedger>,
    pub prices: Arc<dyn PriceStore>,
    pub logger: SharedLogger,
}

impl AppState {
    /// Wire one store up as both the ledger and the price table.
    pub fn new<S>(
        config: GatewayConfig,
        store: S,
        client: reqwest::Client,
        logger: SharedLogger,
    ) -> Self
    where
        S: RequestLedger + PriceStore + 'static,
    {
        let store = Arc::new(store);
        let ledger: Arc<dyn RequestLedger> = store.clone();
        let prices: Arc<dyn PriceStore> = store;

        let tokens = Arc::new(TokenCounter::new());
        if let Err(e) = tokens.warm(Encoding::Cl100kBase) {
            logger.warn("tokens", format!("Tokenizer not preloaded: {e}"));
        }

        let forwarder = Forwarder::new(client, &config.target_url, config.fallback_api_key());
        let gateway = Gateway::new(
            forwarder,
            Arc::clone(&ledger),
            CostAccountant::new(Arc::clone(&prices)),
            tokens,
            logger.clone(),
        );

        Self {
            config,
            gateway,
            ledger,
            prices,
            logger,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/logs", get(handle_logs))
        .route("/prices", get(handle_prices))
        .route("/events", get(handle_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        match self {
            ProxyOutcome::Message(resp) => Json(resp).into_response(),
            ProxyOutcome::Passthrough {
                status,
                headers,
                body,
            } => (status, headers, body).into_response(),
            ProxyOutcome::Stream(frames) => {
                (stream_headers(), Body::from_stream(frames)).into_response()
            }
            ProxyOutcome::Failed { status, error } => (status, Json(error)).into_response(),
        }
    }
}

fn api_error(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse::api_error(message))).into_response()
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("Error parsing request JSON: {e}"));
            let err = ErrorResponse::invalid_request(format!("Error parsing request JSON: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    tracing::debug!(
        model = %request.model,
        streaming = request.stream,
        messages = request.messages.len(),
        "Incoming request"
    );

    let exchange = Exchange {
        client_addr: connect_info
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        headers,
        raw_body: String::from_utf8_lossy(&body).into_owned(),
        request,
    };

    state.gateway.handle(exchange).await.into_response()
}

#[derive(Debug, Serialize)]
struct ModelCard {
    id: String,
    object: &'static str,
    created: i64,
    input_price: f64,
    output_price: f64,
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Response {
    match state.prices.list_prices().await {
        Ok(rows) => {
            let data: Vec<ModelCard> = rows
                .into_iter()
                .map(|row| ModelCard {
                    id: row.price.model_name,
                    object: "model",
                    created: row.created_at.timestamp(),
                    input_price: row.price.input_price,
                    output_price: row.price.output_price,
                })
                .collect();
            Json(serde_json::json!({ "object": "list", "data": data })).into_response()
        }
        Err(e) => {
            state.logger.error("server", format!("Error fetching models: {e}"));
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Error fetching models".to_string())
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Raw query values; anything unparseable falls back to the defaults.
#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    page: Option<String>,
    #[serde(alias = "pageSize")]
    page_size: Option<String>,
}

impl LogsQuery {
    fn page(&self) -> u64 {
        self.page
            .as_deref()
            .and_then(|p| p.parse::<u64>().ok())
            .filter(|p| *p > 0)
            .unwrap_or(1)
    }

    fn page_size(&self) -> u64 {
        self.page_size
            .as_deref()
            .and_then(|p| p.parse::<u64>().ok())
            .filter(|p| (1..=MAX_PAGE_SIZE).contains(p))
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Serialize)]
struct LogView {
    #[serde(flatten)]
    entry: LedgerEntry,
    parsed_usage: Option<UsageData>,
}

async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let page = query.page();
    let page_size = query.page_size();
    let offset = (page - 1).saturating_mul(page_size);

    match state.ledger.list(offset, page_size).await {
        Ok((entries, total_count)) => {
            let logs: Vec<LogView> = entries
                .into_iter()
                .map(|entry| LogView {
                    parsed_usage: entry.parsed_usage(),
                    entry,
                })
                .collect();
            Json(serde_json::json!({
                "logs": logs,
                "page": page,
                "page_size": page_size,
                "total_pages": total_count.div_ceil(page_size),
                "total_count": total_count,
            }))
            .into_response()
        }
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error retrieving logs: {e}"),
        ),
    }
}

async fn handle_prices(State(state): State<Arc<AppState>>) -> Response {
    match state.prices.list_prices().await {
        Ok(rows) => Json(serde_json::json!({
            "total_count": rows.len(),
            "models": rows,
        }))
        .into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error fetching models: {e}"),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn handle_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<serde_json::Value> {
    let events = state
        .logger
        .recent(query.limit.unwrap_or(DEFAULT_EVENT_LIMIT));
    Json(serde_json::json!({ "events": events }))
}
