//! Prometheus metrics for invocation outcomes, agent latency and boot runs.
//!
//! One process-wide registry is created on first use by [`RazarMetrics::global`];
//! later calls return the same instance, so registration is idempotent.
//! Tests may build private instances with [`RazarMetrics::new`].

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder, Gauge,
    HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use thiserror::Error;

use razar_state::RunMetrics;

const MAX_LABEL_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("metrics encoding failed: {0}")]
    Encoding(String),

    #[error("metrics io failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

/// Lower-case and bound a label value.
fn label(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    match lowered.char_indices().nth(MAX_LABEL_LEN) {
        Some((idx, _)) => lowered[..idx].to_string(),
        None => lowered,
    }
}

static GLOBAL: OnceLock<Arc<RazarMetrics>> = OnceLock::new();

/// RAZAR metric families.
#[derive(Clone)]
pub struct RazarMetrics {
    pub invocation_success_total: IntCounterVec,
    pub invocation_failure_total: IntCounterVec,
    pub invocation_retries_total: IntCounterVec,
    pub retry_duration_seconds: HistogramVec,
    pub agent_call_duration_seconds: HistogramVec,

    pub boot_first_attempt_success: IntGauge,
    pub boot_retry_total: IntGauge,
    pub boot_total_time_seconds: Gauge,
    pub boot_success_rate: Gauge,
    pub boot_component_total: IntGauge,
    pub boot_component_success_total: IntGauge,
    pub boot_component_failure_total: IntGauge,

    registry: Registry,
}

impl RazarMetrics {
    /// Build a fresh registry with every family registered.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let invocation_success_total = register_int_counter_vec_with_registry!(
            "razar_ai_invocation_success_total",
            "Remediation handovers that produced an applied patch",
            &["component"],
            registry
        )?;
        let invocation_failure_total = register_int_counter_vec_with_registry!(
            "razar_ai_invocation_failure_total",
            "Remediation handovers that did not produce an applied patch",
            &["component"],
            registry
        )?;
        let invocation_retries_total = register_int_counter_vec_with_registry!(
            "razar_ai_invocation_retries_total",
            "Remediation attempts made per component",
            &["component"],
            registry
        )?;
        let retry_duration_seconds = register_histogram_vec_with_registry!(
            "razar_ai_retry_duration_seconds",
            "Wall time of a component's remediation loop",
            &["component", "agent"],
            vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0],
            registry
        )?;
        let agent_call_duration_seconds = register_histogram_vec_with_registry!(
            "razar_agent_call_duration_seconds",
            "Latency of a single remediation agent call",
            &["agent"],
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 90.0],
            registry
        )?;

        let boot_first_attempt_success = register_int_gauge_with_registry!(
            "razar_boot_first_attempt_success_total",
            "Components healthy on their first launch in the last run",
            registry
        )?;
        let boot_retry_total = register_int_gauge_with_registry!(
            "razar_boot_retry_total",
            "Local launch retries in the last run",
            registry
        )?;
        let boot_total_time_seconds = register_gauge_with_registry!(
            "razar_boot_total_time_seconds",
            "Wall time of the last boot run",
            registry
        )?;
        let boot_success_rate = register_gauge_with_registry!(
            "razar_boot_success_rate",
            "Fraction of attempted components that became healthy",
            registry
        )?;
        let boot_component_total = register_int_gauge_with_registry!(
            "razar_boot_component_total",
            "Components attempted in the last run",
            registry
        )?;
        let boot_component_success_total = register_int_gauge_with_registry!(
            "razar_boot_component_success_total",
            "Components healthy at the end of the last run",
            registry
        )?;
        let boot_component_failure_total = register_int_gauge_with_registry!(
            "razar_boot_component_failure_total",
            "Components that failed in the last run",
            registry
        )?;

        Ok(Self {
            invocation_success_total,
            invocation_failure_total,
            invocation_retries_total,
            retry_duration_seconds,
            agent_call_duration_seconds,
            boot_first_attempt_success,
            boot_retry_total,
            boot_total_time_seconds,
            boot_success_rate,
            boot_component_total,
            boot_component_success_total,
            boot_component_failure_total,
            registry,
        })
    }

    /// The process-wide instance, created on first call.
    pub fn global() -> MetricsResult<Arc<Self>> {
        if let Some(existing) = GLOBAL.get() {
            return Ok(existing.clone());
        }
        let fresh = Arc::new(Self::new()?);
        Ok(GLOBAL.get_or_init(|| fresh).clone())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_invocation(&self, component: &str, success: bool) {
        let c = label(component);
        if success {
            self.invocation_success_total.with_label_values(&[&c]).inc();
        } else {
            self.invocation_failure_total.with_label_values(&[&c]).inc();
        }
    }

    pub fn inc_retry(&self, component: &str) {
        self.invocation_retries_total
            .with_label_values(&[&label(component)])
            .inc();
    }

    pub fn observe_agent_latency(&self, agent: &str, elapsed: Duration) {
        self.agent_call_duration_seconds
            .with_label_values(&[&label(agent)])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_retry_duration(&self, component: &str, agent: &str, elapsed: Duration) {
        self.retry_duration_seconds
            .with_label_values(&[&label(component), &label(agent)])
            .observe(elapsed.as_secs_f64());
    }

    /// Publish the run-level gauges for a finished run.
    pub fn record_run(&self, run: &RunMetrics) {
        self.boot_first_attempt_success
            .set(i64::from(run.first_attempt_successes));
        self.boot_retry_total.set(i64::from(run.retries));
        self.boot_total_time_seconds.set(run.total_time);
        self.boot_success_rate.set(run.success_rate);
        self.boot_component_total.set(run.components.len() as i64);
        self.boot_component_success_total
            .set(run.successes() as i64);
        self.boot_component_failure_total
            .set(i64::from(run.failures()));
    }

    /// Prometheus text exposition of every family.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    /// Write the exposition to a node-exporter textfile, atomically.
    pub fn write_textfile(&self, path: &Path) -> MetricsResult<()> {
        use std::io::Write;

        let text = self.encode_text()?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(text.as_bytes())?;
        tmp.persist(path).map_err(|e| MetricsError::Io(e.error))?;
        Ok(())
    }
}

async fn metrics_handler(State(metrics): State<Arc<RazarMetrics>>) -> impl IntoResponse {
    match metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Router exposing `GET /metrics`.
pub fn metrics_router(metrics: Arc<RazarMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Bind the pull endpoint and serve it on a background task.
pub async fn serve_metrics(
    metrics: Arc<RazarMetrics>,
    port: u16,
) -> MetricsResult<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    let app = metrics_router(metrics);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics endpoint stopped");
        }
    });
    tracing::info!(%addr, "metrics endpoint listening");
    Ok((addr, task))
}
