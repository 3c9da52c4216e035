use crate::http_handler::*;

use anyhow::anyhow;
use axum::routing::get;
use axum::Router;
use proxy::session::registry::SessionRegistry;
use proxy::worker::WorkerRegistry;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

pub struct RwProxyRest;

#[derive(Clone)]
pub struct RwProxyRestState {
    workers: Arc<WorkerRegistry>,
    sessions: Arc<SessionRegistry>,
}

impl RwProxyRestState {
    pub fn new(workers: Arc<WorkerRegistry>, sessions: Arc<SessionRegistry>) -> Self {
        RwProxyRestState { workers, sessions }
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

impl RwProxyRest {
    pub async fn start_server<F>(
        addr: String,
        port: u16,
        state: RwProxyRestState,
        enable_metric: bool,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut app = Router::new()
            .route("/", get("Hi I'm RwProxyREST"))
            .route(
                "/v1/classifier/properties",
                get(classifier_properties).patch(classifier_properties_patch),
            )
            .route("/v1/classifier/cache", get(classifier_cache_state))
            .route("/v1/classifier/stats", get(classifier_cache_stats))
            .route("/v1/sessions", get(session_list))
            .route("/v1/sessions/:id", axum::routing::delete(session_kill))
            .route("/v1/workers", get(worker_list))
            .with_state(state);

        if enable_metric {
            app = app.nest("", route_metrics(MetricsHandler {}));
        }

        app = app.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));
        let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}"))
            .await
            .unwrap();

        match axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                println!("Failed to start RwProxyRest {e:?}");
                Err(anyhow!(e.to_string()))
            }
        }
    }
}
