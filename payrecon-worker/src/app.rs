//! Process wiring: one PostgreSQL pool, the outbox dispatcher and, when
//! PayTR is configured, the reconciliation worker.

use std::sync::Arc;

use anyhow::Context;
use payrecon::handlers::{AlertLogHandler, CreateMissingLedgerEntryHandler};
use payrecon::messages::{
    create_missing_ledger_entry_type, reconciliation_alert_type, webhook_delivery_type,
};
use payrecon::{
    HandlerRegistry, OutboxDispatcher, ReconciliationEngine, ReconciliationWorker, WorkerId,
};
use payrecon_paytr::PaytrReportFetcher;
use payrecon_postgres::{PostgresDatabase, PostgresLedgerStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::settings::Settings;
use crate::webhook::WebhookHandler;

/// Handlers for every message type the platform emits.
pub fn handler_registry(
    settings: &Settings,
    ledger: &Arc<PostgresLedgerStore>,
) -> anyhow::Result<HandlerRegistry> {
    Ok(HandlerRegistry::new()
        .with_handler(
            create_missing_ledger_entry_type()?,
            CreateMissingLedgerEntryHandler::new(
                Arc::clone(ledger),
                settings.policy.clearing_account.clone(),
                settings.policy.suspense_account.clone(),
            ),
        )
        .with_handler(reconciliation_alert_type()?, AlertLogHandler)
        .with_handler(
            webhook_delivery_type()?,
            WebhookHandler::new(settings.webhook_timeout)
                .context("building the webhook HTTP client")?,
        ))
}

/// Connect, migrate and run until `shutdown` is cancelled.
///
/// Both loops finish their in-flight batch or run before returning.
pub async fn run(settings: Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    let database =
        PostgresDatabase::with_config(settings.database_url.expose(), settings.postgres.clone())
            .await
            .context("connecting to PostgreSQL")?;
    database.migrate().await.context("applying migrations")?;

    let outbox = Arc::new(database.outbox());
    let ledger = Arc::new(database.ledger());
    let runs = Arc::new(database.runs());

    let registry = handler_registry(&settings, &ledger)?;
    info!(
        message_types = ?registry.message_types(),
        "[worker.start] handlers registered"
    );
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&outbox),
        registry,
        settings.dispatcher.clone(),
        WorkerId::unique("dispatcher")?,
    );

    match settings.paytr.clone() {
        Some(paytr) => {
            let fetcher = Arc::new(
                PaytrReportFetcher::new(paytr).context("building the PayTR report client")?,
            );
            let engine = ReconciliationEngine::new(
                ledger,
                outbox,
                Arc::clone(&runs),
                settings.policy.clone(),
            );
            let worker = ReconciliationWorker::new(fetcher, engine, runs, settings.worker.clone());
            tokio::join!(
                dispatcher.run(shutdown.clone()),
                worker.run(shutdown.clone())
            );
        }
        None => {
            warn!("[worker.start] PayTR credentials not configured; reconciliation disabled");
            dispatcher.run(shutdown).await;
        }
    }

    info!("[worker.stop] all loops stopped");
    Ok(())
}
