//! Garbage collection command.

use crate::error::{CliError, CliResult};
use colored::Colorize;
use sessionstore_dynamodb::{ConfigLayer, DynamoDbTable, GarbageCollector, SessionConfig};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Sweep the session table once.
pub async fn run(
    runtime: ConfigLayer,
    region: Option<String>,
    endpoint_url: Option<String>,
) -> CliResult<()> {
    let config = SessionConfig::resolve(runtime)?;
    if config.max_age.is_none() && config.max_stale.is_none() {
        return Err(CliError::InvalidArgument(
            "set --max-age or --max-stale (or max_age/max_stale in the configuration)".into(),
        ));
    }

    info!(
        table = %config.table_name,
        max_age = ?config.max_age,
        max_stale = ?config.max_stale,
        "Starting garbage collection"
    );

    let table = DynamoDbTable::connect(region, endpoint_url).await;
    let start = Instant::now();
    let report = GarbageCollector::new(Arc::new(table), Arc::new(config))
        .sweep()
        .await?;

    println!(
        "{} deleted {} of {} scanned sessions in {:.1?} ({} pages, {} batches, {} resubmitted)",
        "done:".green().bold(),
        report.deleted,
        report.scanned,
        start.elapsed(),
        report.pages,
        report.batches,
        report.resubmissions
    );
    Ok(())
}
