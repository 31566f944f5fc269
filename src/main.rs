use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use swcache::cache::strategy::Source;
use swcache::cache::{Method, Request, SqliteStorage};
use swcache::engine::{CacheEngine, FetchOutcome};
use swcache::messages::{ClientEvent, ControlMessage};
use swcache::network::HttpNetwork;
use swcache::{logging, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "A versioned offline cache engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swcache.yaml or $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the configured generation
  Install,
  /// Install the configured generation and promote it immediately
  Activate,
  /// Route one request through the engine
  Fetch {
    /// Absolute URL, or a path relative to the configured origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: Method,
  },
  /// Send a JSON control message, e.g. '{"type":"PING"}'
  Message { json: String },
  /// Show the version and store contents
  Info,
  /// Delete every store
  Clear,
}

type Engine = CacheEngine<SqliteStorage, HttpNetwork>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = EngineConfig::load(args.config.as_deref())?;
  let _log_guard = logging::init(config.log_dir.as_deref())?;

  let storage = SqliteStorage::open(config.database.as_deref())?;
  let network = HttpNetwork::new(Duration::from_secs(config.network_timeout_secs))?;
  let engine = CacheEngine::new(config, storage, network)?;

  if let Some(version) = engine.restore().await? {
    info!(version = %version, "resuming");
  }
  let mut events = engine.subscribe();

  let result = run(&engine, args.command).await;

  // Let write-backs and syncs finish before the process exits
  engine.tasks().wait_idle().await;
  print_events(&mut events)?;

  let output = result?;
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn run(engine: &Engine, command: Command) -> Result<serde_json::Value> {
  let output = match command {
    Command::Install => {
      let phase = engine.on_install().await?;
      json!({ "version": engine.config().version, "phase": phase })
    }
    Command::Activate => {
      engine.on_install().await?;
      let active = engine.on_activate().await?;
      json!({ "active": active })
    }
    Command::Fetch {
      url,
      navigate,
      method,
    } => {
      let url = engine.config().resolve(&url)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      }
      .with_method(method);

      describe(engine.on_fetch(&request).await?)
    }
    Command::Message { json } => {
      let message = ControlMessage::from_json(&json)?;
      let reply = engine.on_message(message).await?;
      serde_json::to_value(reply)?
    }
    Command::Info => json!({
      "version": engine.version_info()?,
      "caches": engine.cache_summary(usize::MAX).await?,
    }),
    Command::Clear => {
      engine.clear_all().await?;
      json!({ "cleared": true })
    }
  };

  Ok(output)
}

fn describe(outcome: FetchOutcome) -> serde_json::Value {
  let (class, source) = match &outcome {
    FetchOutcome::Served { class, served } => (Some(class.to_string()), Some(served.source)),
    FetchOutcome::Passthrough(_) => (None, None),
  };
  let source = source.map(|s| match s {
    Source::Network => "network",
    Source::Cache => "cache",
    Source::Fallback => "fallback",
  });

  let response = outcome.into_response();
  json!({
    "class": class,
    "source": source.unwrap_or("passthrough"),
    "status": response.status,
    "headers": response.headers,
    "body": String::from_utf8_lossy(&response.body),
  })
}

fn print_events(events: &mut broadcast::Receiver<ClientEvent>) -> Result<()> {
  while let Ok(event) = events.try_recv() {
    eprintln!("event: {}", serde_json::to_string(&event)?);
  }
  Ok(())
}
