use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static EXECUTOR_INVOCATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONFIG_RELOADS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EXECUTORS_LOADED: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("extapi_http_requests_total", "Custom API HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create extapi_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "extapi_http_request_duration_seconds",
                    "Custom API HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create extapi_http_request_duration_seconds"),
        )
    })
}

fn executor_invocations_total() -> &'static IntCounterVec {
    EXECUTOR_INVOCATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "extapi_executor_invocations_total",
                    "Executor invocations by kind and outcome code.",
                ),
                &["kind", "outcome"],
            )
            .expect("create extapi_executor_invocations_total"),
        )
    })
}

fn config_reloads_total() -> &'static IntCounterVec {
    CONFIG_RELOADS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "extapi_config_reloads_total",
                    "Executor configuration reload attempts.",
                ),
                &["outcome"],
            )
            .expect("create extapi_config_reloads_total"),
        )
    })
}

fn executors_loaded() -> &'static IntGauge {
    EXECUTORS_LOADED.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "extapi_executors_loaded",
                "Executor definitions in the active registry snapshot.",
            )
            .expect("create extapi_executors_loaded"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

/// `outcome` is `ok` or the error code of the failed invocation.
pub fn observe_executor_invocation(kind: &str, outcome: &str) {
    executor_invocations_total()
        .with_label_values(&[kind, outcome])
        .inc();
}

pub fn observe_config_reload(outcome: &str, executors: Option<usize>) {
    config_reloads_total().with_label_values(&[outcome]).inc();
    if let Some(count) = executors {
        executors_loaded().set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = executors_loaded();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
