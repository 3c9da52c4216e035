use clap::Parser;
use common::ShutdownMessage;
use proxy::backend::monitor::TcpMonitor;
use proxy::classifier::cache;
use proxy::router::rwsplit::{ReadWriteSplit, RwsConfig};
use proxy::server::auth::native::TrustAuthenticator;
use proxy::server::dcb::BackendCredentials;
use proxy::server::listener::Listener;
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::service::Service;
use proxy::session::registry::SessionRegistry;
use proxy::worker::{ExecuteMode, PollEvents, Worker, WorkerRegistry, DEFAULT_MAX_EVENTS};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("ProxySrv process receive shutdown msg {msg}");
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("ProxySrv receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg =  format!("ProxySrv receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn init_tracing(proxy_config: &ProxyServerArgs) -> anyhow::Result<()> {
    let log_level_string = proxy_config
        .log_level
        .clone()
        .unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();
    Ok(())
}

fn start_metrics_and_rest(
    proxy_config: &ProxyServerArgs,
    runtime: &tokio::runtime::Runtime,
    shutdown_rx: &Receiver<ShutdownMessage>,
    workers: Arc<WorkerRegistry>,
    sessions: Arc<SessionRegistry>,
) {
    if !proxy_config.enable_metrics && !proxy_config.enable_rest {
        return;
    }
    if proxy_config.enable_metrics {
        common::metrics::init_metrics_context();
    }
    let http_port = proxy_config.http_port;
    let enable_metrics = proxy_config.enable_metrics;
    let state = web_service::http_server::RwProxyRestState::new(workers, sessions);
    let shutdown_rx_clone = Box::new(shutdown_rx.clone());
    runtime.spawn(async move {
        web_service::http_server::RwProxyRest::start_server(
            "0.0.0.0".to_string(),
            http_port,
            state,
            enable_metrics,
            shutdown_await(shutdown_rx_clone),
        )
        .await
    });
}

fn main() -> anyhow::Result<()> {
    let proxy_config = ProxyServerArgs::parse();
    init_tracing(&proxy_config)?;
    info!("ProxySrv running config args={:?}", proxy_config);

    cache::set_properties(&cache::Properties {
        max_size: proxy_config.qc_cache_size,
    });

    let (inventory, roles) = proxy_config.inventory();
    if inventory.is_empty() {
        warn!("No backends configured; clients will be refused at session start.");
    }
    let sessions = Arc::new(SessionRegistry::new());
    let workers = Arc::new(WorkerRegistry::new());

    let service_config = proxy_config.service_config();
    let credentials = BackendCredentials {
        user: service_config.backend_user.clone(),
        password: service_config.backend_password.clone(),
    };
    let router = ReadWriteSplit::new(
        Arc::clone(&inventory),
        credentials,
        RwsConfig {
            use_sql_variables_in: service_config.use_sql_variables_in,
            ps_log_verbosity: service_config.ps_log_verbosity,
            delayed_retry_timeout: Duration::from_millis(service_config.delayed_retry_timeout_ms),
            verbose: false,
        },
    );
    let service = Service::new(
        "rw-split",
        service_config,
        Vec::new(),
        router,
        Arc::new(TrustAuthenticator),
        Arc::clone(&inventory),
        Arc::clone(&sessions),
    );

    // one routing worker per configured concurrency unit
    let mut worker_threads = Vec::with_capacity(proxy_config.works);
    for i in 0..proxy_config.works {
        let worker = Worker::new(DEFAULT_MAX_EVENTS)?;
        let wt = worker.start(&format!("rw-worker-{i}"))?;
        workers.register(wt.handle().clone());
        if proxy_config.enable_metrics {
            wt.handle().execute(
                |worker| {
                    let labels: Vec<(&'static str, String)> =
                        vec![("worker", worker.id().to_string())];
                    worker.set_tick_hook(Box::new(move |w| {
                        common::metrics::gauge(
                            common::metrics::metric_def::PROXY_WORKER_LOAD_1S,
                            w.load_1s() as f64,
                            Some(&labels),
                        );
                        common::metrics::gauge(
                            common::metrics::metric_def::PROXY_WORKER_LOAD_1M,
                            w.load_1m() as f64,
                            Some(&labels),
                        );
                    }));
                },
                None,
                ExecuteMode::Queued,
            );
        }
        worker_threads.push(wt);
    }

    // the monitor gets a worker of its own so a slow probe never stalls
    // client traffic
    let monitor_worker = Worker::new(DEFAULT_MAX_EVENTS)?.start("rw-monitor")?;
    {
        let inventory = Arc::clone(&inventory);
        let interval = Duration::from_millis(proxy_config.monitor_interval_ms);
        monitor_worker.handle().execute(
            move |worker| {
                let mut monitor = TcpMonitor::new("tcp-probe", inventory, roles);
                // publish an initial view before the first interval elapses
                use proxy::backend::monitor::Monitor;
                monitor.tick();
                monitor.start(worker, interval);
            },
            None,
            ExecuteMode::Queued,
        );
    }

    // the listener lives on the first worker; accepted sessions spread
    // over all of them
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", proxy_config.port).parse()?;
    {
        let workers_for_listener = Arc::clone(&workers);
        let sessions_for_listener = Arc::clone(&sessions);
        let service_for_listener = Arc::clone(&service);
        let handle = worker_threads[0].handle().clone();
        handle.execute(
            move |worker| {
                match Listener::bind(
                    listen_addr,
                    workers_for_listener,
                    sessions_for_listener,
                    service_for_listener,
                ) {
                    Ok(listener) => {
                        if !worker.add_pollable(PollEvents::IN, listener) {
                            warn!("Could not register listener with worker {}", worker.id());
                        }
                    }
                    Err(e) => warn!("Could not bind {listen_addr}: {e}"),
                }
            },
            None,
            ExecuteMode::Queued,
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("RW_PROXY_REST")
        .worker_threads(2)
        .build()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    start_metrics_and_rest(
        &proxy_config,
        &runtime,
        &shutdown_rx,
        Arc::clone(&workers),
        Arc::clone(&sessions),
    );

    runtime.block_on(async {
        let shutdown_msg = shutdown_signal().await;
        shutdown_tx.send(shutdown_msg).ok();
    });

    info!("ProxySrv shutting down {} workers", worker_threads.len());
    workers.shutdown_all();
    monitor_worker.shutdown();
    for wt in worker_threads {
        wt.join();
    }
    monitor_worker.join();
    Ok(())
}
