//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use sqlx::postgres::PgPoolOptions;
use store::Stores;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workflow::{CheckoutProvider, StripeClient};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn open_stores(config: &Config) -> Stores {
    let Some(ref url) = config.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        return Stores::in_memory();
    };
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    store::run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    tracing::info!("connected to PostgreSQL");
    Stores::postgres(pool)
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Stores and collaborators
    let stores = open_stores(&config).await;
    let provider = config.stripe_api_key.as_ref().map(|key| {
        let client = StripeClient::new(key.clone(), config.collaborator_timeout())
            .expect("failed to build Stripe client");
        Arc::new(client) as Arc<dyn CheckoutProvider>
    });
    if config.stripe_webhook_secret.is_none() && config.paypal_webhook_secret.is_none() {
        tracing::warn!("no webhook secrets configured, all webhooks will be rejected");
    }
    let (state, _auth) = api::create_state(stores, provider, &config).await;

    // 4. Build the application
    let app = api::create_app(state, metrics_handle);

    // 5. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("server shut down gracefully");
}
