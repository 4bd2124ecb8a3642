//! Prometheus metrics HTTP endpoint
//!
//! Exposes access-core metrics in Prometheus text format at /metrics,
//! plus two operator endpoints: POST /barrier/open (manual open) and
//! POST /barrier/reset (re-arm after a safety fault).
//! Uses hyper for the HTTP server.

use crate::domain::types::PlateNumber;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::barrier::BarrierHandle;
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

/// Prometheus metric type
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

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
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
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, open_sessions: usize, site_id: &str) -> String {
    let summary = metrics.report(open_sessions);
    let mut output = String::with_capacity(4096);

    write_detection_metrics(&mut output, site_id, &summary);
    write_session_metrics(&mut output, site_id, &summary);
    write_payment_metrics(&mut output, site_id, &summary);
    write_barrier_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);

    output
}

fn write_detection_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "plategate_detections_total",
        "Total plate detections ingested",
        MetricType::Counter,
        site,
        summary.detections_total,
    );
    write_metric(
        output,
        "plategate_detections_suppressed_total",
        "Detections suppressed by the debounce filter",
        MetricType::Counter,
        site,
        summary.detections_suppressed,
    );
    write_metric(
        output,
        "plategate_detections_dropped_total",
        "Detections dropped due to a full event channel",
        MetricType::Counter,
        site,
        summary.detections_dropped,
    );
    write_metric(
        output,
        "plategate_access_granted_total",
        "Access grants",
        MetricType::Counter,
        site,
        summary.access_granted,
    );
    write_metric(
        output,
        "plategate_access_denied_total",
        "Access denials",
        MetricType::Counter,
        site,
        summary.access_denied,
    );
}

fn write_session_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "plategate_sessions_opened_total",
        "Parking sessions opened",
        MetricType::Counter,
        site,
        summary.sessions_opened,
    );
    write_metric(
        output,
        "plategate_sessions_closed_total",
        "Parking sessions settled or cancelled",
        MetricType::Counter,
        site,
        summary.sessions_closed,
    );
    write_metric(
        output,
        "plategate_open_sessions",
        "Sessions currently active or awaiting payment",
        MetricType::Gauge,
        site,
        summary.open_sessions as u64,
    );
}

fn write_payment_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "plategate_payments_requested_total",
        "Payment transactions requested",
        MetricType::Counter,
        site,
        summary.payments_requested,
    );
    write_metric(
        output,
        "plategate_payments_settled_total",
        "Payment transactions completed",
        MetricType::Counter,
        site,
        summary.payments_settled,
    );
    write_metric(
        output,
        "plategate_payments_failed_total",
        "Payment transactions failed, cancelled or timed out",
        MetricType::Counter,
        site,
        summary.payments_failed,
    );
}

fn write_barrier_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "plategate_barrier_commands_total",
        "Barrier open commands actuated",
        MetricType::Counter,
        site,
        summary.barrier_commands,
    );
    write_metric(
        output,
        "plategate_barrier_faults_total",
        "Barrier safety faults",
        MetricType::Counter,
        site,
        summary.barrier_faults,
    );
    write_metric(
        output,
        "plategate_barrier_state",
        "Current barrier state (0=closed 1=opening 2=open 3=closing 4=fault)",
        MetricType::Gauge,
        site,
        summary.barrier_state,
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "plategate_decision_latency_us",
        "Detection-to-decision latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_decision_latency_us,
    );

    write_metric(
        output,
        "plategate_decision_latency_p50_us",
        "50th percentile decision latency",
        MetricType::Gauge,
        site,
        summary.lat_p50_us,
    );
    write_metric(
        output,
        "plategate_decision_latency_p95_us",
        "95th percentile decision latency",
        MetricType::Gauge,
        site,
        summary.lat_p95_us,
    );
    write_metric(
        output,
        "plategate_decision_latency_p99_us",
        "99th percentile decision latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
    barrier: Option<BarrierHandle>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            // Open-session gauge comes from the pipeline's repository; the
            // scrape path has no handle on it, so report 0 here - the
            // counters and histograms are the important part
            let body = format_prometheus_metrics(&metrics, 0, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        // Manual barrier open - POST /barrier/open
        (&Method::POST, "/barrier/open") => {
            if let Some(barrier) = barrier {
                if let Some(plate) = PlateNumber::normalize("MANUAL") {
                    barrier.request_open(plate);
                }
                info!("manual_barrier_open");
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(r#"{"ok":true}"#)))
                    .expect("static response should not fail"))
            } else {
                Ok(Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(r#"{"ok":false,"error":"barrier_not_configured"}"#)))
                    .expect("static response should not fail"))
            }
        }
        // Operator reset after a safety fault - POST /barrier/reset
        (&Method::POST, "/barrier/reset") => {
            if let Some(barrier) = barrier {
                barrier.reset();
                info!("manual_barrier_reset");
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(r#"{"ok":true}"#)))
                    .expect("static response should not fail"))
            } else {
                Ok(Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(r#"{"ok":false,"error":"barrier_not_configured"}"#)))
                    .expect("static response should not fail"))
            }
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    barrier: Option<BarrierHandle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();
                        let barrier = barrier.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                let barrier = barrier.clone();
                                async move { handle_request(req, metrics, site_id, barrier).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_contains_core_metrics() {
        let metrics = Metrics::new();
        metrics.record_detection_received();
        metrics.record_access_granted();
        metrics.record_decision_latency(250);

        let output = format_prometheus_metrics(&metrics, 3, "lot-1");

        assert!(output.contains("plategate_detections_total{site=\"lot-1\"} 1"));
        assert!(output.contains("plategate_access_granted_total{site=\"lot-1\"} 1"));
        assert!(output.contains("plategate_open_sessions{site=\"lot-1\"} 3"));
        assert!(output.contains("plategate_decision_latency_us_bucket"));
        assert!(output.contains("le=\"+Inf\""));
    }

    #[test]
    fn test_histogram_cumulative_counts() {
        let metrics = Metrics::new();
        metrics.record_decision_latency(50);
        metrics.record_decision_latency(150);
        metrics.record_decision_latency(90_000);

        let output = format_prometheus_metrics(&metrics, 0, "lot-1");

        assert!(output.contains("plategate_decision_latency_us_bucket{site=\"lot-1\",le=\"100\"} 1"));
        assert!(output.contains("plategate_decision_latency_us_bucket{site=\"lot-1\",le=\"200\"} 2"));
        assert!(output.contains("plategate_decision_latency_us_bucket{site=\"lot-1\",le=\"+Inf\"} 3"));
        assert!(output.contains("plategate_decision_latency_us_count{site=\"lot-1\"} 3"));
    }
}
