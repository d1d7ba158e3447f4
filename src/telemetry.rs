//! Tracing setup.
//!
//! Everything goes to stderr: stdout belongs to hook JSON and command output.
//! `MODEGATE_LOG` (falling back to `RUST_LOG`) sets the filter, default `warn`.
//! `MODEGATE_LOG_FORMAT=json` switches to JSON lines. With the `otel` feature
//! and `OTEL_EXPORTER_OTLP_ENDPOINT` set, spans and events are also exported
//! over OTLP/HTTP.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const LOG_ENV: &str = "MODEGATE_LOG";
pub const LOG_FORMAT_ENV: &str = "MODEGATE_LOG_FORMAT";

/// Flushes exporters on drop. Hold it for the life of `main`.
#[must_use]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    providers: Option<otel::Providers>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(providers) = self.providers.take() {
            providers.shutdown();
        }
    }
}

fn env_filter() -> EnvFilter {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_default();
    if directives.trim().is_empty() {
        return EnvFilter::new("warn");
    }
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("warning: ignoring invalid log filter {directives:?}: {e}");
        EnvFilter::new("warn")
    })
}

fn json_requested() -> bool {
    std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init() -> TelemetryGuard {
    let fmt_layer = if json_requested() {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    #[cfg(feature = "otel")]
    {
        use opentelemetry::trace::TracerProvider as _;

        let providers = otel::providers();
        let span_layer = providers
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer.tracer("modegate")));
        let log_layer = providers.as_ref().map(|p| {
            opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&p.logger)
        });
        let _ = tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter())
            .with(span_layer)
            .with(log_layer)
            .try_init();
        TelemetryGuard { providers }
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter())
            .try_init();
        TelemetryGuard {}
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry_otlp::{LogExporter, SpanExporter, WithExportConfig as _};
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

    pub struct Providers {
        pub tracer: SdkTracerProvider,
        pub logger: SdkLoggerProvider,
    }

    impl Providers {
        pub fn shutdown(self) {
            if let Err(e) = self.tracer.shutdown() {
                eprintln!("warning: flushing spans failed: {e}");
            }
            if let Err(e) = self.logger.shutdown() {
                eprintln!("warning: flushing logs failed: {e}");
            }
        }
    }

    /// Exporters for the configured endpoint, `None` when unset or broken.
    pub fn providers() -> Option<Providers> {
        let endpoint = std::env::var(ENDPOINT_ENV).ok()?;
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return None;
        }
        let resource = Resource::builder().with_service_name("modegate").build();

        let spans = SpanExporter::builder()
            .with_http()
            .with_endpoint(format!("{endpoint}/v1/traces"))
            .build()
            .map_err(|e| eprintln!("warning: OTLP span exporter disabled: {e}"))
            .ok()?;
        let logs = LogExporter::builder()
            .with_http()
            .with_endpoint(format!("{endpoint}/v1/logs"))
            .build()
            .map_err(|e| eprintln!("warning: OTLP log exporter disabled: {e}"))
            .ok()?;

        // Simple processors: a hook invocation lives for milliseconds.
        let tracer = SdkTracerProvider::builder()
            .with_resource(resource.clone())
            .with_simple_exporter(spans)
            .build();
        let logger = SdkLoggerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(logs)
            .build();
        Some(Providers { tracer, logger })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        let _a = init();
        let _b = init();
        tracing::info!("still logging");
    }
}
