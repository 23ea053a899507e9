//! headway-bot: MBTA prediction tracker + volume automation.
//!
//! Single-binary Tokio application that:
//! 1. Caches stop predictions in front of the rate-limited MBTA API
//! 2. Keeps pinned stops warm with a background refresher
//! 3. Derives train-pass windows for one designated stop
//! 4. Raises/restores an external audio level once per window
//! 5. Serves the cached data and automation controls over HTTP

mod api;
mod config;

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use tracing::{error, info};

use automation::{build_windows, ActionExecutor, VolumeAutomation};
use mbta_client::MbtaClient;
use predictions::journal::resolve_fetch_log_dir;
use predictions::{BackgroundRefresher, CacheReadOptions, FetchJournal, PredictionCache};

/// MBTA prediction tracker and volume automation
#[derive(Parser)]
#[command(name = "headway-bot", about = "MBTA prediction tracker + volume automation")]
struct Cli {
    /// Fetch the automation stop's predictions once and exit.
    #[arg(long)]
    check_api: bool,

    /// Run one cache read + window derivation and exit without acting.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "headway_bot=info,mbta_client=info,predictions=info,automation=info".into()
            }),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    info!("🚇 headway-bot starting up...");

    // Load configuration.
    let cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Cache: fresh={}s stale={}s timeout={}s limit={}",
        cfg.cache.fresh_ttl_secs,
        cfg.cache.stale_ttl_secs,
        cfg.cache.fetch_timeout_secs,
        cfg.cache.result_limit,
    );
    info!(
        "Automation: {} {} ({}) route={} lead={}min pass={}s poll={}s",
        if cfg.automation.enabled { "on" } else { "off" },
        cfg.automation.stop_name,
        cfg.automation.stop_id,
        cfg.automation.route_id,
        cfg.automation.lead_minutes,
        cfg.automation.pass_seconds,
        cfg.automation.poll_seconds,
    );
    info!(
        "Pinned stops: {:?}",
        cfg.stops.iter().map(|s| &s.stop_id).collect::<Vec<_>>()
    );

    let client = Arc::new(MbtaClient::new(
        &cfg.mbta_api_key,
        Duration::from_secs(cfg.cache.fetch_timeout_secs),
    ));

    // ── Check-api mode ───────────────────────────────────────────────
    if cli.check_api {
        info!("Running API check...");
        let query = common::PredictionQuery {
            stop_id: cfg.automation.stop_id.clone(),
            route_type: Some(cfg.automation.route_type),
            route_id: Some(cfg.automation.route_id.clone()),
            limit: cfg.automation.result_limit,
        };
        match client.fetch_stop_predictions(&query).await {
            Ok(payload) => {
                info!(
                    "✅ API reachable: {} predictions for {}",
                    payload.predictions.len(),
                    payload.stop_id
                );
            }
            Err(e) => {
                error!("❌ API check failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // ── Dry-run mode ─────────────────────────────────────────────────
    if cli.dry_run {
        info!("Running single dry-run evaluation...");
        let cache = PredictionCache::new(client.clone(), &cfg.cache, None);
        let query = common::PredictionQuery {
            stop_id: cfg.automation.stop_id.clone(),
            route_type: Some(cfg.automation.route_type),
            route_id: Some(cfg.automation.route_id.clone()),
            limit: cfg.automation.result_limit,
        };
        match cache.get(&query, CacheReadOptions::default()).await {
            Ok(hit) => {
                let windows = build_windows(&hit.payload.predictions, &cfg.automation);
                info!(
                    "{} predictions ({}) → {} window(s), not acting",
                    hit.payload.predictions.len(),
                    hit.provenance.as_str(),
                    windows.len()
                );
                for w in &windows {
                    info!("  → [{} .. {}] {}", w.start_at, w.end_at, w.summary);
                }
            }
            Err(e) => {
                error!("Dry-run fetch failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // ── Shared state ─────────────────────────────────────────────────
    let journal = match FetchJournal::open(resolve_fetch_log_dir()) {
        Ok(j) => {
            info!("Fetch journal path: {}", j.dir().display());
            Arc::new(std::sync::Mutex::new(j))
        }
        Err(e) => {
            error!("Failed to initialize fetch journal: {}", e);
            std::process::exit(1);
        }
    };

    let cache = PredictionCache::new(client.clone(), &cfg.cache, Some(journal));

    let executor = Arc::new(ActionExecutor::from_config(&cfg.automation));
    if cfg.automation.enabled && executor.channel_count() == 0 {
        info!("Automation has no delivery channels configured; transitions will be state-only");
    }
    let engine = Arc::new(VolumeAutomation::new(
        cfg.automation.clone(),
        cache.clone(),
        executor,
    ));

    // ── Spawn tasks ──────────────────────────────────────────────────
    let refresher = BackgroundRefresher::new(
        cache.clone(),
        cfg.stops.clone(),
        &cfg.refresher,
        cfg.cache.result_limit,
    );
    let refresher_enabled = cfg.refresher.enabled && !cfg.stops.is_empty();
    let refresher_handle = tokio::spawn(async move {
        if refresher_enabled {
            refresher.run().await;
        } else {
            info!("Background refresher disabled");
            std::future::pending::<()>().await;
        }
    });

    let automation_engine = engine.clone();
    let automation_handle = tokio::spawn(async move {
        if automation_engine.enabled() {
            automation_engine.run().await;
        } else {
            std::future::pending::<()>().await;
        }
    });

    // ── HTTP server ──────────────────────────────────────────────────
    let state = web::Data::new(api::ApiState {
        cache: cache.clone(),
        automation: engine.clone(),
        stops: cfg.stops.clone(),
        read_limit: cfg.cache.result_limit,
    });

    let server = match HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind((cfg.server.host.as_str(), cfg.server.port))
    {
        Ok(bound) => bound.run(),
        Err(e) => {
            error!(
                "Failed to bind {}:{}: {}",
                cfg.server.host, cfg.server.port, e
            );
            std::process::exit(1);
        }
    };

    info!(
        "🚀 headway-bot listening on {}:{}. Press Ctrl+C to stop.",
        cfg.server.host, cfg.server.port
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = server => {
            if let Err(e) = result {
                error!("HTTP server exited: {}", e);
            }
        }
        r = refresher_handle => {
            error!("Refresher task exited: {:?}", r);
        }
        r = automation_handle => {
            error!("Automation task exited: {:?}", r);
        }
    }

    info!("headway-bot shut down.");
}
