//! Manual control and metrics HTTP endpoint
//!
//! - `POST /door/open`, `POST /door/close` - Manual intents
//! - `GET /state` - Current door state
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - Liveness

use crate::domain::types::{Action, Intent, Source};
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::controller::DoorController;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const JSON: &str = "application/json";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";
const PLAIN_TEXT: &str = "text/plain";

/// Shared handler state
#[derive(Clone)]
pub struct HttpContext {
    pub controller: Arc<DoorController>,
    pub metrics: Arc<Metrics>,
    pub site_id: Arc<String>,
}

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_intent_metrics(&mut output, site, &summary);
    write_door_metrics(&mut output, site, &summary);
    write_adapter_metrics(&mut output, site, &summary);
    write_histogram(
        &mut output,
        "garage_submit_latency_us",
        "Time spent arbitrating one intent in microseconds",
        site,
        &summary.submit_lat_buckets,
        summary.submit_lat_sum_us,
    );

    output
}

fn write_intent_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let name = "garage_intents_total";
    let _ = writeln!(output, "# HELP {name} Intents submitted by source");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (source, count) in Source::ALL.iter().zip(summary.intents_by_source.iter()) {
        let _ = writeln!(output, "{name}{{site=\"{site}\",source=\"{source}\"}} {count}");
    }

    write_metric(
        output,
        "garage_intents_executed_total",
        "Intents that caused a transition",
        MetricType::Counter,
        site,
        summary.executed_total,
    );
    write_metric(
        output,
        "garage_intents_ignored_total",
        "Intents that were no-ops for the current state",
        MetricType::Counter,
        site,
        summary.ignored_total,
    );
    write_metric(
        output,
        "garage_intents_rejected_total",
        "Intents denied by the auth gate",
        MetricType::Counter,
        site,
        summary.rejected_total,
    );
}

fn write_door_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "garage_door_state",
        "Door state (0=closed, 1=moving, 2=open)",
        MetricType::Gauge,
        site,
        summary.door_state,
    );
    write_metric(
        output,
        "garage_transitions_total",
        "Committed terminal transitions",
        MetricType::Counter,
        site,
        summary.transitions_total,
    );
    write_metric(
        output,
        "garage_auto_closes_total",
        "Idle timeouts that closed the door",
        MetricType::Counter,
        site,
        summary.auto_closes_total,
    );
}

fn write_adapter_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "garage_commands_dropped_total",
        "Control payloads that did not parse into an intent",
        MetricType::Counter,
        site,
        summary.commands_dropped,
    );
    write_metric(
        output,
        "garage_state_publish_failures_total",
        "State updates the transport failed to publish",
        MetricType::Counter,
        site,
        summary.state_publish_failures,
    );
    write_metric(
        output,
        "garage_adapter_errors_total",
        "Capture, recognition and listener failures",
        MetricType::Counter,
        site,
        summary.adapter_errors,
    );
}

/// Resolve a request to (status, content type, body)
fn route(method: &Method, path: &str, ctx: &HttpContext) -> (StatusCode, &'static str, String) {
    match (method, path) {
        (&Method::POST, "/door/open") => manual_intent(ctx, Action::Open),
        (&Method::POST, "/door/close") => manual_intent(ctx, Action::Close),
        (&Method::GET, "/state") => {
            let state = ctx.controller.current_state();
            let body = serde_json::json!({ "state": state.as_str(), "door_open": state.is_open() });
            (StatusCode::OK, JSON, body.to_string())
        }
        (&Method::GET, "/metrics") => {
            (StatusCode::OK, PROMETHEUS_TEXT, format_prometheus_metrics(&ctx.metrics, &ctx.site_id))
        }
        (&Method::GET, "/health") => (StatusCode::OK, PLAIN_TEXT, "ok".to_string()),
        _ => (StatusCode::NOT_FOUND, PLAIN_TEXT, "Not Found".to_string()),
    }
}

fn manual_intent(ctx: &HttpContext, action: Action) -> (StatusCode, &'static str, String) {
    let outcome = ctx.controller.submit(Intent::manual(action));
    info!(action = %action, outcome = %outcome, "manual_command");

    let mut body = serde_json::to_value(outcome).unwrap_or_default();
    if let Some(map) = body.as_object_mut() {
        map.insert("state".to_string(), ctx.controller.current_state().as_str().into());
    }
    (StatusCode::OK, JSON, body.to_string())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: HttpContext,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, content_type, body) = route(req.method(), req.uri().path(), &ctx);
    Ok(build_response(status, content_type, body))
}

/// Every route answers through here; no CORS headers are set
fn build_response(
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

/// Start the manual control / metrics HTTP server
pub async fn start_http_server(
    addr: SocketAddr,
    ctx: HttpContext,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, site = %ctx.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, ctx.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
