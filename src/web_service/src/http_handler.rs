use crate::http_server::RwProxyRestState;

use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use proxy::classifier::cache::{
    get_properties, get_thread_cache_state, get_thread_cache_stats, set_properties, CacheStats,
    Properties, StateEntry,
};
use proxy::classifier::inspector::InspectParser;
use proxy::classifier::type_mask_to_string;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Clone, Copy)]
pub struct MetricsHandler;

impl MetricsHandler {
    pub fn render(&self) -> String {
        if let Some(prometheus_handle) = common::metrics::try_handle() {
            prometheus_handle.render()
        } else {
            "Please initialize the prometheus context first.".to_string()
        }
    }
}

pub fn route_metrics<S>(metrics_handler: MetricsHandler) -> Router<S> {
    Router::new()
        .route("/metrics", get(metrics_get))
        .with_state(metrics_handler)
}

pub async fn metrics_get(State(handler): State<MetricsHandler>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        handler.render(),
    )
}

#[derive(Serialize, Deserialize)]
pub struct ClassifierProperties {
    parameters: ClassifierParameters,
}

#[derive(Serialize, Deserialize)]
pub struct ClassifierParameters {
    cache_size: i64,
}

pub async fn classifier_properties() -> Json<ClassifierProperties> {
    let properties = get_properties();
    Json(ClassifierProperties {
        parameters: ClassifierParameters {
            cache_size: properties.max_size,
        },
    })
}

pub async fn classifier_properties_patch(
    Json(body): Json<ClassifierProperties>,
) -> impl IntoResponse {
    let accepted = set_properties(&Properties {
        max_size: body.parameters.cache_size,
    });
    if accepted {
        info!(
            "Classifier cache size set to {} bytes",
            body.parameters.cache_size
        );
        StatusCode::NO_CONTENT
    } else {
        StatusCode::BAD_REQUEST
    }
}

#[derive(Serialize)]
pub struct CacheEntryJson {
    id: String,
    attributes: CacheEntryAttributes,
}

#[derive(Serialize)]
pub struct CacheEntryAttributes {
    hits: i64,
    classification: Classification,
}

#[derive(Serialize)]
pub struct Classification {
    parse_result: String,
    type_mask: String,
    operation: String,
    size: usize,
}

/// Top-N cache entries aggregated over every worker. The collection runs
/// serially, one worker at a time, which keeps the peak footprint at 1/N
/// of a parallel gather.
pub async fn classifier_cache_state(
    State(state): State<RwProxyRestState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<CacheEntryJson>> {
    let top: usize = params
        .get("top")
        .and_then(|t| t.parse().ok())
        .unwrap_or(20);

    let workers = Arc::clone(state.workers());
    let collected: Arc<Mutex<BTreeMap<String, StateEntry>>> =
        Arc::new(Mutex::new(BTreeMap::new()));
    let sink = Arc::clone(&collected);

    let state_future = tokio::task::spawn_blocking(move || {
        workers.execute_serially(Arc::new(move |_worker| {
            let parser = InspectParser::new();
            let mut guard = sink.lock().unwrap();
            get_thread_cache_state(&mut guard, top, &parser);
        }));
    });
    let _ = state_future.await;

    let mut entries: Vec<(String, StateEntry)> = collected
        .lock()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    entries.sort_by(|a, b| b.1.hits.cmp(&a.1.hits));
    entries.truncate(top);

    Json(
        entries
            .into_iter()
            .map(|(stmt, entry)| CacheEntryJson {
                id: stmt,
                attributes: CacheEntryAttributes {
                    hits: entry.hits,
                    classification: Classification {
                        parse_result: entry.result.status.as_ref().to_string(),
                        type_mask: type_mask_to_string(entry.result.type_mask),
                        operation: entry.result.op.as_ref().to_string(),
                        size: entry.result.size,
                    },
                },
            })
            .collect(),
    )
}

#[derive(Serialize, Default)]
pub struct CacheStatsJson {
    size: i64,
    inserts: i64,
    hits: i64,
    misses: i64,
    evictions: i64,
}

pub async fn classifier_cache_stats(
    State(state): State<RwProxyRestState>,
) -> Json<CacheStatsJson> {
    let workers = Arc::clone(state.workers());
    let total: Arc<Mutex<CacheStats>> = Arc::new(Mutex::new(CacheStats::default()));
    let sink = Arc::clone(&total);

    let stats_future = tokio::task::spawn_blocking(move || {
        workers.execute_serially(Arc::new(move |_worker| {
            if let Some(stats) = get_thread_cache_stats() {
                let mut guard = sink.lock().unwrap();
                guard.size += stats.size;
                guard.inserts += stats.inserts;
                guard.hits += stats.hits;
                guard.misses += stats.misses;
                guard.evictions += stats.evictions;
            }
        }));
    });
    let _ = stats_future.await;

    let stats = *total.lock().unwrap();
    Json(CacheStatsJson {
        size: stats.size,
        inserts: stats.inserts,
        hits: stats.hits,
        misses: stats.misses,
        evictions: stats.evictions,
    })
}

#[derive(Serialize, Clone)]
pub struct WorkerJson {
    id: i32,
    load_1s: i64,
    load_1m: i64,
    load_1h: i64,
    current_fds: i64,
    total_fds: i64,
    polls: u64,
    poll_events: u64,
    event_queue_max: i64,
    accepts: u64,
    reads: u64,
    writes: u64,
    hangups: u64,
    errors: u64,
    incomplete_reads: u64,
    delayed_calls: usize,
}

pub async fn worker_list(State(state): State<RwProxyRestState>) -> Json<Vec<WorkerJson>> {
    let workers = Arc::clone(state.workers());
    let collected: Arc<Mutex<Vec<WorkerJson>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);

    let fut = tokio::task::spawn_blocking(move || {
        workers.execute_serially(Arc::new(move |worker| {
            let stats = worker.statistics();
            sink.lock().unwrap().push(WorkerJson {
                id: worker.id(),
                load_1s: worker.load_1s(),
                load_1m: worker.load_1m(),
                load_1h: worker.load_1h(),
                current_fds: worker.current_fd_count(),
                total_fds: worker.total_fd_count(),
                polls: stats.n_polls,
                poll_events: stats.n_pollev,
                event_queue_max: stats.evq_max,
                accepts: stats.n_accept,
                reads: stats.n_read,
                writes: stats.n_write,
                hangups: stats.n_hup,
                errors: stats.n_error,
                incomplete_reads: stats.n_incomplete_read,
                delayed_calls: worker.dcall_count(),
            });
        }));
    });
    let _ = fut.await;

    let list = collected.lock().unwrap().clone();
    Json(list)
}

#[derive(Serialize)]
pub struct SessionJson {
    id: u64,
    user: String,
    host: String,
    service: String,
    state: String,
    trx_state: String,
}

pub async fn session_kill(
    State(state): State<RwProxyRestState>,
    axum::extract::Path(id): axum::extract::Path<u64>,
) -> StatusCode {
    let workers = Arc::clone(state.workers());
    let sessions = Arc::clone(state.sessions());
    let killed = tokio::task::spawn_blocking(move || {
        proxy::session::kill_session_by_id(&workers, &sessions, id)
    })
    .await
    .unwrap_or(false);
    if killed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn session_list(State(state): State<RwProxyRestState>) -> Json<Vec<SessionJson>> {
    let sessions = state
        .sessions()
        .snapshot()
        .into_iter()
        .map(|session| SessionJson {
            id: session.id(),
            user: session.user(),
            host: session.host().to_string(),
            service: session.service().to_string(),
            state: session.state().as_ref().to_string(),
            trx_state: format!("{:?}", session.trx_state()),
        })
        .collect();
    Json(sessions)
}
