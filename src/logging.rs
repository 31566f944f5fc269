use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  fmt,
  layer::{Layer, SubscriberExt},
  util::SubscriberInitExt,
  EnvFilter,
};

const DEFAULT_DIRECTIVE: &str = "swcache=info";

/// Install the global subscriber: stderr, plus a daily rolling file when
/// `log_dir` is set. `RUST_LOG` overrides the default filter.
///
/// Keep the returned guard alive until exit so buffered file output is flushed.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

  let stderr_layer = fmt::layer()
    .compact()
    .with_target(true)
    .with_writer(std::io::stderr)
    .boxed();

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "swcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .boxed();
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
