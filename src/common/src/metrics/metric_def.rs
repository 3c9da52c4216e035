pub const PROXY_MAX_CONN: &str = "proxy_max_connections";
pub const PROXY_CURR_CONN: &str = "proxy_curr_connections";
pub const PROXY_COM_LATENCY: &str = "proxy_com_latency";
pub const PROXY_WORKER_LOAD_1S: &str = "proxy_worker_load_one_second";
pub const PROXY_WORKER_LOAD_1M: &str = "proxy_worker_load_one_minute";
pub const PROXY_SESSIONS: &str = "proxy_sessions";
pub const PROXY_QC_CACHE_HITS: &str = "proxy_qc_cache_hits";
pub const PROXY_QC_CACHE_MISSES: &str = "proxy_qc_cache_misses";
pub const PROXY_QC_CACHE_EVICTIONS: &str = "proxy_qc_cache_evictions";
pub const PROXY_ROUTE_MASTER: &str = "proxy_route_to_master";
pub const PROXY_ROUTE_SLAVE: &str = "proxy_route_to_slave";
pub const PROXY_ROUTE_ALL: &str = "proxy_route_to_all";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { ProxyMaxConnections, max_connections, MetricType::Gauge, PROXY_MAX_CONN, "The max number of connections allowed by the proxy."},
    { ProxyCurrentConnections, current_connections, MetricType::Gauge, PROXY_CURR_CONN, "The current connection count of the proxy."},
    { ProxyComLatency, com_latency, MetricType::Histogram, PROXY_COM_LATENCY, "Latency of command execution."},
    { WorkerLoadOneSecond, worker_load_1s, MetricType::Gauge, PROXY_WORKER_LOAD_1S, "Per worker busy ratio over the last second."},
    { WorkerLoadOneMinute, worker_load_1m, MetricType::Gauge, PROXY_WORKER_LOAD_1M, "Per worker busy ratio over the last minute."},
    { ProxySessions, sessions, MetricType::Gauge, PROXY_SESSIONS, "Number of live client sessions."},
    { QcCacheHits, qc_cache_hits, MetricType::Counter, PROXY_QC_CACHE_HITS, "Query classifier cache hits."},
    { QcCacheMisses, qc_cache_misses, MetricType::Counter, PROXY_QC_CACHE_MISSES, "Query classifier cache misses."},
    { QcCacheEvictions, qc_cache_evictions, MetricType::Counter, PROXY_QC_CACHE_EVICTIONS, "Query classifier cache evictions."},
    { RouteToMaster, route_to_master, MetricType::Counter, PROXY_ROUTE_MASTER, "Statements routed to the master."},
    { RouteToSlave, route_to_slave, MetricType::Counter, PROXY_ROUTE_SLAVE, "Statements routed to a slave."},
    { RouteToAll, route_to_all, MetricType::Counter, PROXY_ROUTE_ALL, "Statements routed to all backends."}
);
