//! PinVault Background Worker
//!
//! Runs the daily billing sweep and reconciles orders whose webhook never
//! arrived. Without Cashfree credentials it stays up in a heartbeat-only mode.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use pinvault_billing::{BillingConfig, BillingService, CashfreeClient};
use pinvault_shared::{DatabaseConfig, PgRecordStore, RecordStore};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 00:05 UTC daily, after the date has rolled over everywhere we bill
const BILLING_SWEEP_SCHEDULE: &str = "0 5 0 * * *";
const RECONCILE_SCHEDULE: &str = "0 */10 * * * *";
const HEARTBEAT_SCHEDULE: &str = "0 */5 * * * *";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "pinvault_worker=info,pinvault_billing=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting PinVault worker");

    let db_config = DatabaseConfig::from_env().context("database configuration")?;
    let pool = db_config.connect().await.context("failed to connect to database")?;
    pinvault_shared::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool));

    let provider = match CashfreeClient::from_env() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Payment provider not configured, running heartbeat only");
            return run_minimal_mode().await;
        }
    };

    let billing = Arc::new(BillingService::new(
        store.clone(),
        Arc::new(provider),
        BillingConfig::from_env(),
    ));

    let scheduler = JobScheduler::new().await?;

    let sweep_store = store.clone();
    let sweep_billing = billing.clone();
    let sweep_job = Job::new_async(BILLING_SWEEP_SCHEDULE, move |_uuid, _lock| {
        let store = sweep_store.clone();
        let billing = sweep_billing.clone();
        Box::pin(async move {
            let today = OffsetDateTime::now_utc().date();
            info!(%today, "Running billing sweep");
            if let Err(e) = jobs::run_billing_sweep(store.as_ref(), &billing, today).await {
                error!(error = %e, "Billing sweep aborted");
            }
        })
    })?;
    scheduler.add(sweep_job).await?;

    let reconcile_billing = billing.clone();
    let reconcile_job = Job::new_async(RECONCILE_SCHEDULE, move |_uuid, _lock| {
        let billing = reconcile_billing.clone();
        Box::pin(async move {
            if let Err(e) = jobs::reconcile_pending(&billing).await {
                error!(error = %e, "Pending order reconciliation aborted");
            }
        })
    })?;
    scheduler.add(reconcile_job).await?;

    scheduler.add(heartbeat_job()?).await?;

    scheduler.start().await?;
    info!(
        sweep = BILLING_SWEEP_SCHEDULE,
        reconcile = RECONCILE_SCHEDULE,
        "Scheduler started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");
    Ok(())
}

fn heartbeat_job() -> anyhow::Result<Job> {
    Ok(Job::new_async(HEARTBEAT_SCHEDULE, |_uuid, _lock| {
        Box::pin(async move {
            info!("Worker heartbeat");
        })
    })?)
}

async fn run_minimal_mode() -> anyhow::Result<()> {
    let scheduler = JobScheduler::new().await?;
    scheduler.add(heartbeat_job()?).await?;
    scheduler.start().await?;

    info!("Worker running in minimal mode");
    tokio::signal::ctrl_c().await?;
    Ok(())
}
