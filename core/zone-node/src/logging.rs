use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "ZONEWEAVE_DEBUG_LOG";

/// Logs to stderr, and to a daily file under `log_dir` when one is given.
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init(log_dir: Option<&Path>, zone_name: &str) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir.map(|dir| prepare_log_dir(dir, zone_name)) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        Some(Err(err)) => {
            eprintln!("zone-node: file logging disabled: {}", err);
            (None, None)
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn prepare_log_dir(
    dir: &Path,
    zone_name: &str,
) -> std::io::Result<tracing_appender::rolling::RollingFileAppender> {
    fs_err::create_dir_all(dir)?;
    let prefix = if zone_name.is_empty() {
        "zone.log".to_string()
    } else {
        format!("zone-{}.log", zone_name)
    };
    Ok(tracing_appender::rolling::daily(dir, prefix))
}
