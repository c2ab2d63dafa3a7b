use anyhow::Context;
use chrono::Utc;

use stockrelay_infra::PipelineConfig;
use stockrelay_products::{ProductCreated, ProductEvent, ProductId};
use stockrelay_worker::app::{Pipeline, build_audit_log, build_broker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockrelay_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let audit = build_audit_log(&config).await?;

    let broker = build_broker(&config).await.context("broker unavailable")?;
    let pipeline = Pipeline::start(&config, broker, audit).await?;

    let sample = ProductEvent::created(ProductCreated {
        id: ProductId::new(1),
        name: "Martillo".to_string(),
        description: "Martillo de carpintero".to_string(),
        price_cents: 9990,
        stock: 7,
        category: "Herramientas".to_string(),
        occurred_at: Utc::now(),
    })?;

    match pipeline.publisher().publish_event(&sample).await {
        Ok(message_id) => tracing::info!(%message_id, "sample product published"),
        Err(err) => tracing::warn!(
            error = %err,
            status = err.boundary_status().http_status(),
            "sample product not published"
        ),
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    for (queue, stats) in pipeline.shutdown().await {
        tracing::info!(
            %queue,
            received = stats.received,
            succeeded = stats.succeeded,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            unsettled = stats.unsettled,
            "consumer stopped"
        );
    }

    Ok(())
}
