//! Metrics definitions for the gateway.

use shared::metrics_defs::{MetricDef, MetricType};

pub const HTTP_REQUESTS_TOTAL: MetricDef = MetricDef {
    name: "http_requests_total",
    metric_type: MetricType::Counter,
    description: "Requests served by the external listener, by handler and status code",
    labels: &["handler", "code"],
};

pub const FORWARD_REQUESTS_TOTAL: MetricDef = MetricDef {
    name: "forward_requests_total",
    metric_type: MetricType::Counter,
    description: "The number of forwarded remote-write requests",
    labels: &["result"],
};

pub const AUTHORIZE_CACHE_GETS_TOTAL: MetricDef = MetricDef {
    name: "authorize_cache_gets_total",
    metric_type: MetricType::Counter,
    description: "Lookups against the authorization response cache",
    labels: &["result"],
};

pub const AUTHORIZE_CACHE_STORE_FAILURES_TOTAL: MetricDef = MetricDef {
    name: "authorize_cache_store_failures_total",
    metric_type: MetricType::Counter,
    description: "Authorization verdicts that could not be written to the cache",
    labels: &[],
};

pub const RATELIMITED_REQUESTS_TOTAL: MetricDef = MetricDef {
    name: "ratelimited_requests_total",
    metric_type: MetricType::Counter,
    description: "Uploads rejected because the cluster pushed again too soon",
    labels: &[],
};

pub const DROPPED_SERIES_TOTAL: MetricDef = MetricDef {
    name: "dropped_series_total",
    metric_type: MetricType::Counter,
    description: "Series dropped because no allow-list rule matched",
    labels: &[],
};

// TODO: derive this table with a macro instead of listing every def by hand.
pub const ALL_METRICS: &[MetricDef] = &[
    HTTP_REQUESTS_TOTAL,
    FORWARD_REQUESTS_TOTAL,
    AUTHORIZE_CACHE_GETS_TOTAL,
    AUTHORIZE_CACHE_STORE_FAILURES_TOTAL,
    RATELIMITED_REQUESTS_TOTAL,
    DROPPED_SERIES_TOTAL,
];

/// Registers descriptions with the installed recorder so the Prometheus
/// exposition carries HELP lines even before a metric is first incremented.
pub fn describe_all() {
    for def in ALL_METRICS {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}
