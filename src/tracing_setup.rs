use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with JSON output
pub fn init_tracing(component: &str) -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install JSON subscriber")?;

    tracing::info!("Elasti {} structured logging initialized", component);
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing(component: &str) -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install console subscriber")?;

    tracing::info!("Elasti {} console logging initialized", component);
    Ok(())
}

/// Pick the subscriber from `LOG_FORMAT` (`console` or JSON by default).
pub fn init_from_env(component: &str) -> Result<()> {
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("console") => init_console_tracing(component),
        _ => init_tracing(component),
    }
}

/// Span for one long-running component (reconciler, scale handler, server)
pub fn component_span(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span for one forward attempt to a private service
pub fn create_forward_span(target_url: &str, method: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "forward",
        target.url = target_url,
        http.method = method,
        retry.count = attempt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "/api/test", "req-123");
        assert_eq!(span.metadata().map(|m| m.name()), Some("request"));
    }

    #[test]
    fn test_create_forward_span() {
        let span = create_forward_span("http://orders-pvt.shop", "POST", 2);
        assert_eq!(span.metadata().map(|m| m.name()), Some("forward"));
    }

    #[test]
    fn test_second_init_reports_error() {
        let first = init_tracing("test");
        let second = init_console_tracing("test");
        // whichever ran first in this process owns the global subscriber
        assert!(first.is_err() || second.is_err());
    }
}
