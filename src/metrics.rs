use opentelemetry::KeyValue;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::inference::Stage;

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: default_transport(),
            endpoint: default_endpoint(),
        }
    }
}

fn default_transport() -> String {
    "http".into()
}

fn default_endpoint() -> String {
    "http://localhost:8428/opentelemetry/v1/metrics".into()
}

/// Build and register a global meter provider.
/// For gRPC transport, requires an active tokio runtime context.
pub fn init_meter_provider(config: &MetricsConfig) -> Option<SdkMeterProvider> {
    if !config.enabled {
        return None;
    }

    let resource = Resource::builder_empty()
        .with_attributes([KeyValue::new("service.name", "desktriage")])
        .build();

    let provider = match config.transport.as_str() {
        "grpc" => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(&config.endpoint)
                .with_protocol(Protocol::Grpc)
                .with_timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| log::warn!("metrics grpc exporter: {e}"))
                .ok()?;
            SdkMeterProvider::builder()
                .with_periodic_exporter(exporter)
                .with_resource(resource)
                .build()
        }
        _ => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(&config.endpoint)
                .with_timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| log::warn!("metrics http exporter: {e}"))
                .ok()?;
            SdkMeterProvider::builder()
                .with_periodic_exporter(exporter)
                .with_resource(resource)
                .build()
        }
    };

    opentelemetry::global::set_meter_provider(provider.clone());
    Some(provider)
}

/// Count one inference call and record its latency.
/// No-op until a provider is registered.
pub fn record_inference(stage: Stage, ok: bool, start: Instant) {
    let meter = opentelemetry::global::meter("desktriage");
    let outcome = if ok { "ok" } else { "error" };
    meter.u64_counter("desktriage_inference_total").build().add(
        1,
        &[
            KeyValue::new("stage", stage.as_str()),
            KeyValue::new("outcome", outcome),
        ],
    );
    meter
        .f64_histogram("desktriage_inference_duration_seconds")
        .build()
        .record(
            start.elapsed().as_secs_f64(),
            &[KeyValue::new("stage", stage.as_str())],
        );
}

pub fn record_ticket_created() {
    opentelemetry::global::meter("desktriage")
        .u64_counter("desktriage_tickets_total")
        .build()
        .add(1, &[]);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    opentelemetry::global::meter("desktriage")
        .u64_counter("desktriage_cache_lookups_total")
        .build()
        .add(1, &[KeyValue::new("result", result)]);
}
