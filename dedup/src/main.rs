use std::error::Error;
use std::sync::Arc;

use dedup_core::clock::{Clock, SystemClock};
use dedup_core::config::{SecondaryBackend, Settings};
use dedup_core::forwarder::{DedupForwarder, Outcome};
use dedup_core::identity::FieldExtractor;
use dedup_core::primary::{LocalWindowStore, Rehydration};
use dedup_core::retention::manager::RetentionManager;
use dedup_core::secondary::in_memory_store::InMemoryStore;
use dedup_core::secondary::redis_store::RedisStore;
use dedup_core::secondary::{Secondary, SecondaryStore};
use dedup_core::witness::Witness;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod input;
mod log;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load()?;
    info!(?settings, "Starting dedup forwarder");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (primary, rehydration) =
        LocalWindowStore::open(settings.primary_config(), clock.now()).await?;

    match &settings.secondary {
        SecondaryBackend::Memory => {
            info!("Using the in-memory secondary store, it does not survive this process");
            forward(&settings, clock, primary, rehydration, InMemoryStore::new()).await
        }
        SecondaryBackend::Redis { url, key_prefix } => {
            let store = RedisStore::new(url, key_prefix.clone()).await?;
            forward(&settings, clock, primary, rehydration, store).await
        }
    }
}

/// Runs the forwarder over stdin until EOF or Ctrl-C, with the witness and the retention manager
/// in the background.
async fn forward<S: SecondaryStore>(
    settings: &Settings,
    clock: Arc<dyn Clock>,
    primary: LocalWindowStore,
    rehydration: Rehydration,
    store: S,
) -> Result<(), Box<dyn Error>> {
    let schedule = settings.schedule()?;
    let cancel = CancellationToken::new();

    let secondary = Secondary::new(
        store.clone(),
        schedule,
        Arc::clone(&clock),
        settings.secondary_timeout,
    );
    let (witness, witness_handle) = Witness::new(secondary.clone(), settings.witness_config());
    let witness_task = tokio::spawn(witness.run(cancel.clone()));

    let retention = RetentionManager::new(
        store,
        schedule,
        Arc::clone(&clock),
        settings.retention_check_interval,
    );
    let retention_task = tokio::spawn(retention.run(cancel.clone()));

    let extractor = FieldExtractor::new(settings.key_fields.clone())?;
    let mut forwarder = DedupForwarder::new(
        settings.forwarder_config(),
        Arc::new(extractor),
        primary,
        witness_handle,
        log::LogProcessor,
        log::LogRejectionSink,
        Arc::clone(&clock),
    )
    .with_secondary(secondary);
    if rehydration.gap {
        forwarder = forwarder.recovering_from_gap(clock.now());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0u64;
    let result: Result<(), Box<dyn Error>> = loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break Ok(());
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(lines = line_number, "Reached end of input");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let handled = match input::parse_line(&line, line_number) {
            Ok(message) => forwarder.handle(message).await,
            Err(e) => {
                error!(line = line_number, error = %e, "Unparseable input line, rejecting");
                let message = input::undecodable(line, line_number, clock.now());
                forwarder.reject_malformed(message).await
            }
        };
        match handled {
            Ok(Outcome::Failed(cause)) => error!(line = line_number, %cause, "Message failed"),
            Ok(outcome) => debug!(line = line_number, ?outcome, "Message handled"),
            Err(e) => break Err(e.into()),
        }
    };

    cancel.cancel();
    let stats = witness_task.await?;
    retention_task.await?;
    info!(?stats, "Witness stopped");
    result
}
