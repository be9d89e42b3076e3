mod config;
mod health;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{Router, http};
use chrono::Utc;
use clap::{Parser, Subcommand};
use matrimony_store::{
    Kv, MemoryKv, RedisKv, Stores,
    services::{LogSender, MessageSender, PremiumExpiryEngine, Reconciler, SmtpSender},
};
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, state::AppState};

#[derive(Parser)]
#[command(name = "matrimony-worker")]
#[command(about = "Scheduled jobs and health endpoint for the matrimony data layer")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq, Debug)]
enum Command {
    /// Serve the health endpoint and run premium expiry on a timer (default)
    Serve,
    /// Run one premium expiry pass and exit
    ExpireOnce,
    /// Repair membership sets, email lookups and photo mirrors, then exit
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;

    // Set up tracing: JSON in production, human-readable otherwise
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.is_production() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }

    let kv: Arc<dyn Kv> = if config.uses_memory_store() {
        tracing::warn!("using in-memory store, data is not persisted");
        Arc::new(MemoryKv::new())
    } else {
        Arc::new(RedisKv::open(&config.redis_url)?)
    };

    let sender: Arc<dyn MessageSender> = match config.smtp_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Arc::new(SmtpSender::new(url, &config.mail_from)?),
        None => {
            tracing::warn!("no SMTP URL configured, outbound messages are only logged");
            Arc::new(LogSender)
        }
    };

    let stores = Stores::new(kv.clone());
    let engine = Arc::new(PremiumExpiryEngine::new(
        stores.users.clone(),
        stores.notifications.clone(),
        kv.clone(),
        sender,
    ));

    match args.command.unwrap_or(Command::Serve) {
        Command::ExpireOnce => {
            let report = engine.run(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Reconcile => {
            let report = Reconciler::new(kv).run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Serve => serve(config, kv, engine).await,
    }
}

async fn serve(config: Config, kv: Arc<dyn Kv>, engine: Arc<PremiumExpiryEngine>) -> Result<()> {
    let state = AppState::new(kv);

    let scheduler = tokio::spawn(run_scheduler(
        engine,
        state.clone(),
        Duration::from_secs(config.expiry_interval_secs.max(1)),
        config.run_on_start,
    ));

    // Request ID header name
    let x_request_id = http::HeaderName::from_static("x-request-id");

    let app = Router::new()
        .nest("/health", health::router())
        .with_state(state)
        // Request ID: generate UUID, include in logs, return in response
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &http::Request<axum::body::Body>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            },
        ))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.abort();
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Run the expiry engine every `interval`. A failed run is logged and retried
/// at the next tick.
async fn run_scheduler(
    engine: Arc<PremiumExpiryEngine>,
    state: AppState,
    interval: Duration,
    run_on_start: bool,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    if !run_on_start {
        // The first tick completes immediately.
        ticker.tick().await;
    }

    loop {
        ticker.tick().await;
        match engine.run(Utc::now()).await {
            Ok(report) => *state.last_expiry_run.write().await = Some(report),
            Err(err) => tracing::error!(error = %err, "premium expiry run failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrimony_store::models::User;

    #[test]
    fn subcommand_defaults_to_serve() {
        let args = Args::try_parse_from(["matrimony-worker"]).unwrap();
        assert_eq!(args.command.unwrap_or(Command::Serve), Command::Serve);

        let args = Args::try_parse_from(["matrimony-worker", "expire-once"]).unwrap();
        assert_eq!(args.command, Some(Command::ExpireOnce));

        let args = Args::try_parse_from(["matrimony-worker", "reconcile"]).unwrap();
        assert_eq!(args.command, Some(Command::Reconcile));
    }

    #[tokio::test]
    async fn scheduler_records_report() {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let stores = Stores::new(kv.clone());
        stores
            .users
            .create(User {
                email: Some("a@example.com".into()),
                premium: true,
                premium_expiry: Some(Utc::now() - chrono::Duration::days(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        let engine = Arc::new(PremiumExpiryEngine::new(
            stores.users.clone(),
            stores.notifications.clone(),
            kv.clone(),
            Arc::new(LogSender),
        ));
        let state = AppState::new(kv);

        let handle = tokio::spawn(run_scheduler(
            engine,
            state.clone(),
            Duration::from_secs(3600),
            true,
        ));
        let mut report = None;
        for _ in 0..50 {
            report = state.last_expiry_run.read().await.clone();
            if report.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        let report = report.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.expired, 1);
    }
}
