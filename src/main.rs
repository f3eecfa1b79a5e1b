// src/main.rs

//! The command-line entry point: fetches URLs through the cache twice so the
//! second round shows what the cache served.

use anyhow::{Context, Result};
use http::Method;
use spinelcache::config::Config;
use spinelcache::core::clock::system_clock;
use spinelcache::core::dispatch::{DispatchRequest, ReqwestDispatcher, fetch};
use spinelcache::core::metrics::gather_metrics;
use spinelcache::core::tasks::ExpirySweeper;
use spinelcache::core::CacheInterceptor;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("SpinelCache version {VERSION}");
        return Ok(());
    }

    // The config path is optional; without it the defaults are used.
    let config_index = args.iter().position(|arg| arg == "--config");
    let config = match config_index {
        Some(i) => {
            let Some(path) = args.get(i + 1) else {
                eprintln!("--config flag requires a value");
                std::process::exit(1);
            };
            match Config::from_file(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                    std::process::exit(1);
                }
            }
        }
        None => Config::default(),
    };

    let urls: Vec<&String> = args
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(i, arg)| {
            !arg.starts_with("--") && config_index.is_none_or(|c| *i != c + 1)
        })
        .map(|(_, arg)| arg)
        .collect();
    if urls.is_empty() {
        eprintln!("Usage: spinelcache [--config /path/to/config.toml] <url>...");
        std::process::exit(1);
    }

    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    if let Err(e) = run(&config, &urls).await {
        error!("spinelcache error: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: &Config, urls: &[&String]) -> Result<()> {
    let clock = system_clock();
    let store = config.open_store(clock.clone())?;
    let options = config.cache_options(store.clone(), clock)?;

    let transport = ReqwestDispatcher::new().context("Failed to build the HTTP client")?;
    let interceptor = Arc::new(
        CacheInterceptor::new(Arc::new(transport), options)
            .context("Failed to build the cache interceptor")?,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = ExpirySweeper::new(
            store.clone(),
            Duration::from_secs(config.sweeper.interval_secs),
        );
        Some(tokio::spawn(sweeper.run(shutdown_tx.subscribe())))
    } else {
        None
    };

    for url in urls {
        for round in 1..=2 {
            let request = DispatchRequest::from_url(Method::GET, url)
                .with_context(|| format!("Invalid URL '{url}'"))?;
            match fetch(interceptor.as_ref(), request).await {
                Ok(response) => {
                    let state = match (response.header("age"), response.header("warning")) {
                        (Some(_), Some(_)) => "stale",
                        (Some(_), None) => "hit",
                        _ => "network",
                    };
                    println!(
                        "[{round}] {url} -> {} {} ({state}, age: {}, {} bytes)",
                        response.status(),
                        response.head.status_message,
                        response.header("age").unwrap_or_else(|| "-".to_string()),
                        response.body.len()
                    );
                }
                Err(e) => {
                    warn!("Request to {} failed: {}", url, e);
                    println!("[{round}] {url} -> error: {e}");
                }
            }
        }
    }

    interceptor.wait_for_revalidations().await;
    let stats = interceptor.stats();
    info!(
        "Cache stats: hits={} stale_hits={} misses={} bypasses={} stores={} entries={}",
        stats.hits,
        stats.stale_hits,
        stats.misses,
        stats.bypasses,
        stats.stores,
        store.len().await.unwrap_or_default()
    );

    if config.metrics.enabled {
        print!("{}", gather_metrics());
    }

    let _ = shutdown_tx.send(());
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }
    Ok(())
}
