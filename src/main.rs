use std::{process, sync::Arc};

use artifact_cache::{
    cache::{CacheConfig, CacheHandler, StoreClient},
    commands, config,
    infra::{error::InfraError, http_purge, http_store::HttpBlobStore, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "artifact-cache failed");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "artifact-cache failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    telemetry::init(&settings.logging)?;

    let backend = HttpBlobStore::from_settings(&settings.store)?;
    let mut store = StoreClient::new(Arc::new(backend)).with_timeout(settings.store.timeout);
    if let Some(namespace) = settings.store.namespace.as_deref() {
        store = store.with_namespace(namespace);
    }
    let purger = http_purge::build_purger(&settings.purge, settings.store.timeout)?;
    let handler = CacheHandler::new(store, &CacheConfig::from(&settings.cache), purger);

    info!(
        store = ?handler.store(),
        memo_enabled = handler.memo().is_enabled(),
        "artifact cache ready"
    );

    let report = commands::execute(&handler, &cli_args.command).await?;
    let output = serde_json::to_string_pretty(&report)?;
    println!("{output}");

    if report.background.failed > 0 {
        return Err(InfraError::Background {
            failed: report.background.failed,
        });
    }
    Ok(())
}
