//! Subscriber setup shared by the daemon and the interactive node.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured
/// level. Logs go to stderr so the interactive node keeps stdout for chat.
pub fn setup_logging(config: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // journald already stamps time and host
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let result = match config.format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        _ if is_systemd => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .compact()
            .try_init(),
        _ => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_timer(HostTimer::new())
            .compact()
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("⚠️ Logging already initialized: {}", e);
    }
}

/// Short hostname, e.g. `relay1` for `relay1.example.net`.
pub fn short_hostname() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    hostname.split('.').next().unwrap_or(&hostname).to_string()
}

/// UTC timestamp followed by the host, e.g. `2025-12-10 18:09:43.150 [relay1]`.
struct HostTimer {
    hostname: String,
}

impl HostTimer {
    fn new() -> Self {
        Self {
            hostname: short_hostname(),
        }
    }
}

impl fmt::time::FormatTime for HostTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hostname_has_no_domain() {
        let name = short_hostname();
        assert!(!name.is_empty());
        assert!(!name.contains('.'));
    }
}
