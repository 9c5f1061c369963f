use call_orchestrator::config::Config;
use call_orchestrator::consts::{DB_ACQUIRE_TIMEOUT_SECS, DB_MAX_CONNECTIONS};
use call_orchestrator::deepgram_client::DeepgramClient;
use call_orchestrator::handlers;
use call_orchestrator::memory_store::MemoryStore;
use call_orchestrator::openai_client::OpenAiAnalyzer;
use call_orchestrator::pg_store::PgStore;
use call_orchestrator::store::CallStore;
use call_orchestrator::tasks::route_domain_events;
use call_orchestrator::twilio_client::TwilioClient;
use call_orchestrator::types::AppState;

use sqlx::postgres::PgPoolOptions;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("no .env loaded: {e}");
    }
    let config = Config::from_env().expect("invalid configuration");

    let level = LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::DEBUG);
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("sqlx", LevelFilter::WARN),
            ("call_orchestrator", level),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let store: Arc<dyn CallStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(DB_MAX_CONNECTIONS)
                .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
                .connect(url)
                .await
                .expect("failed to connect to postgres");
            let store = PgStore::new(pool);
            store.migrate().await.expect("failed to run migrations");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let http_client = reqwest::Client::builder()
        .timeout(config.settings.provider_timeout)
        .build()
        .expect("failed to build http client");
    let telephony = Arc::new(TwilioClient::new(http_client.clone(), &config));
    let transcriber = Arc::new(DeepgramClient::new(
        http_client.clone(),
        &config.deepgram_api_key,
    ));
    let analyzer = Arc::new(OpenAiAnalyzer::new(
        http_client,
        &config.openai_api_key,
        &config.openai_model,
    ));

    let app_state = Arc::new(AppState::new(
        config.settings.clone(),
        store,
        telephony,
        transcriber,
        analyzer,
    ));

    tokio::spawn(route_domain_events(
        app_state.bus.subscribe(),
        app_state.dialer.clone(),
        app_state.recordings.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(app_state.dialer.clone().run(shutdown_rx));

    let app = handlers::router(app_state);
    let addr = config.bind_addr.parse().expect("invalid BIND_ADDR");
    info!(addr=%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error=%e, "failed to listen for ctrl-c");
            }
        })
        .await
        .unwrap();

    let _ = shutdown_tx.send(true);
    let _ = scheduler.await;
}
