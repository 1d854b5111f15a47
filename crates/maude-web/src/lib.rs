//! Read-only JSON surface over the ledger and the deduplicated event query.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use maude_core::EngineError;
use maude_sources::SourceCatalog;
use maude_sync::{store_status, CanonicalPolicy, EventQuery, IngestError, MaudeStore, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "maude-web";

#[derive(Clone)]
pub struct AppState {
    pub store: MaudeStore,
    pub catalog: Arc<SourceCatalog>,
}

impl AppState {
    pub fn new(store: MaudeStore, catalog: Arc<SourceCatalog>) -> Self {
        Self { store, catalog }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    crate_name: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    pub brand_name: Option<String>,
    pub generic_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub product_code: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub dedup: Option<bool>,
    pub policy: Option<String>,
}

impl EventsParams {
    pub fn to_query(&self) -> Result<EventQuery, EngineError> {
        let mut query = EventQuery::new();
        if let Some(v) = &self.brand_name {
            query = query.brand_name(v.clone());
        }
        if let Some(v) = &self.generic_name {
            query = query.generic_name(v.clone());
        }
        if let Some(v) = &self.manufacturer_name {
            query = query.manufacturer_name(v.clone());
        }
        if let Some(v) = &self.product_code {
            query = query.product_code(v.clone());
        }

        let start = self.start.as_deref().map(parse_date).transpose()?;
        let end = self.end.as_deref().map(parse_date).transpose()?;
        if start.is_some() || end.is_some() {
            query = query.received_between(start, end);
        }
        if let Some(dedup) = self.dedup {
            query = query.deduplicate(dedup);
        }
        if let Some(policy) = &self.policy {
            query = query.policy(policy.parse::<CanonicalPolicy>()?);
        }
        Ok(query)
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidRequest(format!("'{raw}' is not a YYYY-MM-DD date")))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ledger", get(ledger_handler))
        .route("/events", get(events_handler))
        .route("/events/multi-report", get(multi_report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("MAUDE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let catalog = match &config.sources_file {
        Some(path) => SourceCatalog::from_yaml_path(path)?,
        None => SourceCatalog::builtin(),
    };
    let store = MaudeStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    serve(AppState::new(store, Arc::new(catalog)), port).await
}

async fn health_handler() -> Json<Health> {
    Json(Health {
        status: "ok",
        crate_name: CRATE_NAME,
    })
}

async fn ledger_handler(State(state): State<Arc<AppState>>) -> Response {
    match store_status(&state.store, &state.catalog).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(err),
    }
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsParams>,
) -> Response {
    let query = match params.to_query() {
        Ok(query) => query,
        Err(err) => return error_response(err.into()),
    };
    match maude_sync::DedupQueryEngine::default()
        .query(state.store.pool(), &query)
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => error_response(err),
    }
}

async fn multi_report_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsParams>,
) -> Response {
    let query = match params.to_query() {
        Ok(query) => query,
        Err(err) => return error_response(err.into()),
    };
    match maude_sync::DedupQueryEngine::default()
        .multi_report_events(state.store.pool(), &query)
        .await
    {
        Ok(events) => Json(events).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: IngestError) -> Response {
    let status = match &err {
        IngestError::Engine(
            EngineError::InvalidRequest(_) | EngineError::SchemaDrift { .. } | EngineError::UnknownTable(_),
        ) => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorBody { error: err.to_string() })).into_response()
}
