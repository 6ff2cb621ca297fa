use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,actix_web=info";

/// Install the global subscriber
///
/// `RUST_LOG` overrides the default filter. `LOG_FORMAT=json` switches to
/// structured output.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(false)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(false).init();
    }
}
