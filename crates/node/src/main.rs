//! Fulfillment node entry point.

use courier::{CourierRepository, PostgresCourierRepository};
use inventory::{PostgresStockRepository, StockRepository};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use node::config::{DatabaseUrls, LogFormat};
use node::{Config, InMemoryNode, Node, NodeError, Outboxed, PostgresNode};
use saga::{OrderRepository, PostgresOrderRepository, SagaReaper};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

fn init_tracing(config: &Config) -> Result<(), NodeError> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
    }
    Ok(())
}

async fn connect(url: &str) -> Result<PgPool, NodeError> {
    Ok(PgPoolOptions::new().max_connections(10).connect(url).await?)
}

async fn connect_postgres(urls: &DatabaseUrls) -> Result<PostgresNode, NodeError> {
    let orders = PostgresOrderRepository::new(connect(&urls.orders).await?);
    orders.ensure_schema().await?;
    let stock = PostgresStockRepository::new(connect(&urls.inventory).await?);
    stock.ensure_schema().await?;
    let couriers = PostgresCourierRepository::new(connect(&urls.couriers).await?);
    couriers.ensure_schema().await?;

    Ok(Node::new(orders, stock, couriers))
}

async fn serve<O, S, C>(
    node: Node<O, S, C>,
    config: Config,
    metrics_handle: PrometheusHandle,
) -> Result<(), NodeError>
where
    O: OrderRepository + Outboxed + 'static,
    S: StockRepository + Outboxed + 'static,
    C: CourierRepository + Outboxed + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = vec![
        tokio::spawn(
            node.order_publisher(config.publisher.clone())
                .run(shutdown_rx.clone()),
        ),
        tokio::spawn(
            node.stock_publisher(config.publisher.clone())
                .run(shutdown_rx.clone()),
        ),
        tokio::spawn(
            node.courier_publisher(config.publisher.clone())
                .run(shutdown_rx.clone()),
        ),
        tokio::spawn(
            node.dispatcher(config.max_delivery_attempts)
                .run(shutdown_rx.clone()),
        ),
        tokio::spawn(SagaReaper::new(node.saga.clone(), config.reaper.clone()).run(shutdown_rx.clone())),
    ];
    tasks.extend(node.spawn_claim_retention(
        config.idempotency_retention,
        config.publisher.purge_interval,
        &shutdown_rx,
    ));

    let app = node::create_app(node.health_state(), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting fulfillment node");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stops the background loops once the HTTP server has drained.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    match &config.databases {
        Some(urls) => {
            let node = connect_postgres(urls).await?;
            tracing::info!("using PostgreSQL stores");
            serve(node, config, metrics_handle).await?;
        }
        None => {
            tracing::info!("no database configured, using in-memory stores");
            serve(InMemoryNode::in_memory(), config, metrics_handle).await?;
        }
    }

    tracing::info!("node shut down gracefully");
    Ok(())
}
