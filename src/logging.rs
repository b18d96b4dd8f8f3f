use tracing_subscriber::EnvFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing.
///
/// Set `TASKMUX_LOG` to a file path to log to a file. Log files get unique
/// names, `{path}.{timestamp}.{pid}`, so concurrent runs never collide.
/// Without it, logs go to stderr when `to_stderr` is set and are disabled
/// otherwise (an attached raw-mode terminal must not receive log lines).
pub fn init_tracing(to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Ok(log_path) = std::env::var("TASKMUX_LOG") {
        let pid = std::process::id();
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let unique_path = format!("{}.{}.{}", log_path, timestamp, pid);

        let Ok(file) = std::fs::File::create(&unique_path) else {
            eprintln!("Warning: Failed to create log file: {}", unique_path);
            return;
        };

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_level(true);

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .try_init();
        return;
    }

    if !to_stderr {
        return;
    }

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}
