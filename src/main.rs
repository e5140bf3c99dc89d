use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use offline_sync::cache::CacheManager;
use offline_sync::config::Config;
use offline_sync::net::{HttpMethod, HttpTransport, RequestOptions};
use offline_sync::offline::{is_offline_capable, OfflineManager};

#[derive(Parser, Debug)]
#[command(name = "offline-sync")]
#[command(about = "Tiered cache and offline request queue for the tools catalog")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a URL with offline fallback; writes are queued when undeliverable
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: HttpMethod,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Cache the essential catalog resources for offline use
  Warm,
  /// Replay queued requests now
  Sync,
  /// Show connectivity and queue state
  Status,
  /// Show per-tier cache counters
  Stats,
  /// Drop every queued request
  ClearQueue,
  /// Run the probe and sync loops until Ctrl-C
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _log_guard = offline_sync::logging::init(&config.logging, &data_dir.join("logs"))?;

  let cache = Arc::new(CacheManager::open(&config.cache, &data_dir)?);
  let transport = Arc::new(HttpTransport::new(
    &config.base_url,
    config.network.request_timeout(),
  )?);
  let manager = OfflineManager::new(
    cache,
    transport,
    config.offline.clone(),
    &config.network,
  )
  .await;

  match args.command {
    Command::Fetch { url, method, body } => {
      let body = body
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| eyre!("Invalid JSON body: {}", e))?;
      let options = match body {
        Some(body) => RequestOptions::with_body(method, body),
        None => RequestOptions {
          method,
          ..RequestOptions::default()
        },
      };

      manager.probe().await;
      if !manager.network_state().is_online() && !method.is_mutating() && !is_offline_capable(&url) {
        warn!(url = %url, "Offline and the endpoint is not cached for offline use");
      }

      match manager.smart_fetch::<Value>(&url, options).await {
        Some(data) => print_json(&data)?,
        None if method.is_mutating() => {
          println!("Request queued ({} pending)", manager.network_status().queue_size)
        }
        None => return Err(eyre!("No data for {}", url)),
      }
    }
    Command::Warm => {
      let cached = manager.cache_essential_resources().await;
      println!("Cached {} essential resources", cached);
    }
    Command::Sync => {
      manager.probe().await;
      match manager.force_sync().await {
        Some(report) => print_json(&report)?,
        None => println!("Offline, {} requests pending", manager.network_status().queue_size),
      }
    }
    Command::Status => {
      manager.probe().await;
      print_json(&manager.network_status())?;
    }
    Command::Stats => print_json(&manager.cache().stats())?,
    Command::ClearQueue => {
      let pending = manager.network_status().queue_size;
      manager.clear_queue().await;
      println!("Cleared {} queued requests", pending);
    }
    Command::Watch => {
      let _subscription = manager.on_network_change(|online| {
        info!(online, "Network status changed");
      });
      manager.start();
      info!("Watching connectivity, press Ctrl-C to stop");

      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

      manager.shutdown().await;
      info!("Stopped");
    }
  }

  Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", text);
  Ok(())
}
