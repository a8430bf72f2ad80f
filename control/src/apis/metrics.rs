//! Controller metrics
//!
//! Prometheus registry for reconciliation passes plus the `/metrics` listener.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconciliation pass duration
    static ref PASS_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "tollgate_pass_duration_seconds",
            "Reconciliation pass duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["outcome"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Reconciliation passes total, by outcome (noop, reload, restart)
    static ref PASSES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "tollgate_passes_total",
            "Total number of reconciliation passes",
        );
        let counter = IntCounterVec::new(opts, &["outcome"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Sub-step failures, by step
    static ref STEP_ERRORS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "tollgate_step_errors_total",
            "Total number of failed reconciliation sub-steps",
        );
        let counter = IntCounterVec::new(opts, &["step"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Backends referenced by the last pass
    static ref ACTIVE_BACKENDS: IntGauge = {
        let gauge = IntGauge::new(
            "tollgate_active_backends",
            "Backends referenced by the last reconciliation pass",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };
}

/// Outcome label of a pass
pub fn pass_outcome(reload: bool, restart: bool) -> &'static str {
    if restart {
        "restart"
    } else if reload {
        "reload"
    } else {
        "noop"
    }
}

/// Record a completed reconciliation pass
pub fn record_pass(duration_secs: f64, reload: bool, restart: bool, active_backends: usize) {
    let outcome = pass_outcome(reload, restart);
    PASS_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
    PASSES_TOTAL.with_label_values(&[outcome]).inc();
    ACTIVE_BACKENDS.set(active_backends as i64);
}

/// Record a failed sub-step
pub fn record_step_error(step: &str) {
    STEP_ERRORS_TOTAL.with_label_values(&[step]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

async fn handle_metrics_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = if req.uri().path() != "/metrics" {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")))
    } else {
        match gather_controller_metrics() {
            Ok(body) => Response::builder()
                .header("content-type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body))),
            Err(e) => {
                error!("{}", e);
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(e)))
            }
        }
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Serve `/metrics` until the task is dropped
pub async fn serve_metrics(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics endpoint listening on {}", addr);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error on {}: {}", addr, e);
                continue;
            }
        };
        debug!("Accepted metrics connection from {}", peer_addr);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics_request))
                .await
            {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_outcome_precedence() {
        assert_eq!(pass_outcome(false, false), "noop");
        assert_eq!(pass_outcome(true, false), "reload");
        assert_eq!(pass_outcome(true, true), "restart");
    }

    #[test]
    fn test_pass_metrics_are_exported() {
        record_pass(0.01, true, false, 3);
        record_step_error("global");

        let output = gather_controller_metrics().unwrap();
        assert!(
            output.contains("tollgate_passes_total"),
            "Pass counter should be exported"
        );
        assert!(
            output.contains("tollgate_pass_duration_seconds"),
            "Pass duration histogram should be exported"
        );
        assert!(
            output.contains("tollgate_step_errors_total{step=\"global\"}"),
            "Step errors should carry the step label"
        );
    }
}
