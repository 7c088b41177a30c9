use clap::Parser;
use graphweld::engine::ConsolidationEngine;
use graphweld::store::SqliteStore;
use graphweld::{BatchReport, Config, Mention};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Consolidate extracted mentions (JSONL, one mention per line) into the graph")]
struct Args {
    /// Path to the mentions file
    mentions: PathBuf,

    /// Mentions per submitted batch
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// Consolidate into an in-memory engine and discard results
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();

    log::info!("Starting graphweld ingestion");

    // Load configuration
    let config = Config::load()?;
    log::info!("Configuration loaded successfully");
    log::info!("Database path: {}", config.engine.db_path.display());

    // Open the engine over the configured store
    let engine = if args.dry_run {
        log::info!("Mode: dry run (in-memory, nothing persisted)");
        ConsolidationEngine::in_memory(config).await?
    } else {
        let store = SqliteStore::open(&config.engine.db_path, Path::new("migrations")).await?;
        ConsolidationEngine::open(config, Arc::new(store)).await?
    };

    // Parse mentions, skipping malformed lines without aborting
    let file = std::fs::File::open(&args.mentions)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", args.mentions.display(), e))?;
    let mut mentions: Vec<Mention> = Vec::new();
    let mut parse_errors: usize = 0;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Mention>(&line) {
            Ok(mention) => mentions.push(mention),
            Err(e) => {
                parse_errors += 1;
                log::error!("✗ line {}: {}", lineno + 1, e);
            }
        }
    }

    if mentions.is_empty() {
        log::warn!("No mentions found in {}. Nothing to do.", args.mentions.display());
        return Ok(());
    }
    log::info!("Parsed {} mentions ({} malformed lines skipped)", mentions.len(), parse_errors);

    // Submit in batches so each batch boundary is a consistent point
    let start = Instant::now();
    let batch_size = args.batch_size.max(1);
    let num_batches = (mentions.len() + batch_size - 1) / batch_size;
    let mut total = BatchReport::default();

    for (idx, batch) in mentions.chunks(batch_size).enumerate() {
        let report = engine.submit_batch(batch.to_vec()).await?;
        log::info!(
            "✓ batch {}/{}: {} accepted, {} duplicates, {} rejected",
            idx + 1,
            num_batches,
            report.accepted,
            report.duplicates,
            report.rejected
        );
        total.mentions += report.mentions;
        total.accepted += report.accepted;
        total.disputed += report.disputed;
        total.duplicates += report.duplicates;
        total.rejected += report.rejected;
        total.entities_created += report.entities_created;
        total.merges += report.merges;
        total.tentative_attachments += report.tentative_attachments;
        total.relationships_created += report.relationships_created;
        total.conflicts_opened += report.conflicts_opened;
        total.conflicts_resolved += report.conflicts_resolved;
    }

    let elapsed = start.elapsed();
    let stats = engine.stats().await;

    // Report final statistics
    log::info!("=== Consolidation Complete ===");
    log::info!("Mentions submitted: {}", total.mentions);
    log::info!("  Accepted: {}", total.accepted);
    log::info!("  Disputed: {}", total.disputed);
    log::info!("  Duplicates (fingerprint): {}", total.duplicates);
    log::info!("  Rejected (validation): {}", total.rejected);
    log::info!("Entities created: {}", total.entities_created);
    log::info!("Merges executed: {}", total.merges);
    log::info!("Tentative attachments: {}", total.tentative_attachments);
    log::info!("Relationships created: {}", total.relationships_created);
    log::info!("Conflicts opened: {}", total.conflicts_opened);
    log::info!("Conflicts auto-resolved: {}", total.conflicts_resolved);
    log::info!(
        "Graph now: {} entities, {} relationships, {} open conflicts",
        stats.live_entities,
        stats.relationships,
        stats.open_conflicts
    );
    log::info!("Time: {:?}", elapsed);

    if parse_errors > 0 || total.rejected > 0 {
        log::warn!("Some mentions were skipped. Check logs above for details.");
    }

    Ok(())
}
