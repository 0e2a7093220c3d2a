use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "DEDUP_DEBUG";

fn panic_message<'a>(panic_info: &'a PanicHookInfo<'_>) -> Option<&'a str> {
    let payload = panic_info.payload();
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Logs a panic as one `error!` event with its location as a field.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let backtrace = Backtrace::capture();
    let location = panic_info.location();

    match (location, panic_message(panic_info)) {
        (Some(location), Some(message)) if backtrace.status() != BacktraceStatus::Captured => {
            tracing::error!(%location, "Panicked: {message}");
        }
        _ => tracing::error!("Panicked: {panic_info}\n{backtrace}"),
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the level, which is `info` by default and
/// `debug` when `DEDUP_DEBUG=true`. Logs are flattened JSON unless in debug mode.
pub fn register() {
    let debug_mode = std::env::var(ENV_DEBUG).is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let default_log_level = if debug_mode { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::builder()
        .with_default_directive(default_log_level.into())
        .from_env_lossy();

    // stdin carries the messages, keep logs on stderr
    let layer = if debug_mode {
        fmt::layer().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
