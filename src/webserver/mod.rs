//! Read-only HTTP API over the in-memory sink.
//!
//! - `GET /hotel_statistics?city=Kyiv&limit=10` current rows as JSON
//! - `GET /top_cities?limit=10` cities by their largest distinct hotel count
//! - `GET /metrics` Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::extract::Query;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::metrics;
use crate::outputs::MemorySink;

/// Env var choosing the API port when the config doesn't.
pub const PORT_ENV_VAR: &str = "HOTEL_STATS_API_PORT";

const DEFAULT_PORT: u16 = 3030;

struct State {
    sink: MemorySink,
}

#[derive(Debug, Deserialize)]
struct RowsQuery {
    city: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TopQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CityCount {
    city: String,
    distinct_hotel_count: u64,
}

/// The configured port, then [`PORT_ENV_VAR`], then 3030.
pub fn resolve_port(configured: Option<u16>) -> PipelineResult<u16> {
    if let Some(port) = configured {
        return Ok(port);
    }
    match std::env::var(PORT_ENV_VAR) {
        Ok(var) => var
            .parse()
            .map_err(|err| PipelineError::Config(format!("unable to parse {PORT_ENV_VAR}: {err}"))),
        Err(_) => Ok(DEFAULT_PORT),
    }
}

fn router(sink: MemorySink) -> Router {
    let shared_state = Arc::new(State { sink });
    Router::new()
        .route("/hotel_statistics", get(get_statistics))
        .route("/top_cities", get(get_top_cities))
        .route("/metrics", get(get_metrics))
        .layer(Extension(shared_state))
}

pub async fn run_webserver(sink: MemorySink, port: u16) -> PipelineResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting statistics API server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(router(sink).into_make_service())
        .await
        .map_err(|err| {
            PipelineError::Config(format!(
                "unable to create local webserver at port {port}: {err}"
            ))
        })
}

/// Serve the API from a small dedicated runtime so the scheduler
/// thread is never blocked by requests.
pub fn start_server_runtime(sink: MemorySink, port: u16) -> PipelineResult<Runtime> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("webserver-threads")
        .enable_all()
        .build()
        .map_err(|err| PipelineError::Config(format!("error starting webserver runtime: {err}")))?;
    rt.spawn(async move {
        if let Err(err) = run_webserver(sink, port).await {
            tracing::error!("{err}");
        }
    });
    Ok(rt)
}

async fn get_statistics(
    Extension(state): Extension<Arc<State>>,
    Query(query): Query<RowsQuery>,
) -> impl IntoResponse {
    let mut rows = match &query.city {
        Some(city) => state.sink.rows_for_city(city),
        None => state.sink.rows(),
    };
    if let Some(limit) = query.limit {
        rows.truncate(limit);
    }
    Json(rows)
}

async fn get_top_cities(
    Extension(state): Extension<Arc<State>>,
    Query(query): Query<TopQuery>,
) -> impl IntoResponse {
    let top: Vec<_> = state
        .sink
        .top_cities(query.limit.unwrap_or(10))
        .into_iter()
        .map(|(city, distinct_hotel_count)| CityCount {
            city,
            distinct_hotel_count,
        })
        .collect();
    Json(top)
}

async fn get_metrics() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(CONTENT_TYPE, "text/plain")],
            err.to_string(),
        ),
    }
}
