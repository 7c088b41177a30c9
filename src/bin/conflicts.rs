use clap::Parser;
use graphweld::conflict::{ConflictFilter, ConflictRecord, ConflictStatus};
use graphweld::engine::ConsolidationEngine;
use graphweld::model::AttrValue;
use graphweld::store::SqliteStore;
use graphweld::Config;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "conflicts")]
#[command(about = "List, resolve, or reopen attribute conflicts")]
struct Args {
    /// Only list conflicts with this status (disputed or resolved)
    #[arg(long)]
    status: Option<String>,

    /// Resolve this conflict id (requires --value)
    #[arg(long)]
    resolve: Option<Uuid>,

    /// Winning value for --resolve: a number, or anything else as text
    #[arg(long)]
    value: Option<String>,

    /// Operator note recorded with the resolution
    #[arg(long)]
    note: Option<String>,

    /// Reopen this resolved conflict id
    #[arg(long)]
    reopen: Option<Uuid>,
}

fn parse_status(s: &str) -> Result<ConflictStatus, anyhow::Error> {
    match s.to_lowercase().as_str() {
        "disputed" => Ok(ConflictStatus::Disputed),
        "resolved" => Ok(ConflictStatus::Resolved),
        other => anyhow::bail!("unknown status '{}' (expected disputed or resolved)", other),
    }
}

/// A bare number becomes a Number value; anything else is Text. Timestamps
/// and references can be passed as JSON-tagged values instead.
fn parse_value(s: &str) -> AttrValue {
    if let Ok(value) = serde_json::from_str::<AttrValue>(s) {
        return value;
    }
    if let Ok(n) = s.parse::<f64>() {
        return AttrValue::Number(n);
    }
    AttrValue::Text(s.to_string())
}

fn print_record(record: &ConflictRecord) {
    println!(
        "{} [{}] {} on {}",
        record.id, record.status, record.attribute, record.subject
    );
    println!("  opened: {}", record.opened_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(resolved_at) = record.resolved_at {
        let method = record
            .resolution_method
            .map(|m| format!(" by {}", m))
            .unwrap_or_default();
        println!(
            "  resolved: {}{}",
            resolved_at.format("%Y-%m-%d %H:%M:%S"),
            method
        );
    }
    if let Some(reopened_from) = record.reopened_from {
        println!("  reopened from: {}", reopened_from);
    }
    if let Some(note) = &record.resolution_note {
        println!("  note: {}", note);
    }
    for competing in &record.competing {
        let accepted = record
            .accepted_key
            .as_deref()
            .map(|k| k == competing.value.canonical_key())
            .unwrap_or(false);
        println!(
            "  {} '{}' (confidence {:.2}, {} source{})",
            if accepted { "✓" } else { "•" },
            competing.value,
            competing.confidence,
            competing.sources.len(),
            if competing.sources.len() == 1 { "" } else { "s" }
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load()?;
    let store = SqliteStore::open(&config.engine.db_path, Path::new("migrations")).await?;
    let engine = ConsolidationEngine::open(config, Arc::new(store)).await?;

    if let Some(conflict_id) = args.resolve {
        let raw = args
            .value
            .ok_or_else(|| anyhow::anyhow!("--resolve requires --value"))?;
        let chosen = parse_value(&raw);
        let record = engine
            .resolve_conflict(conflict_id, chosen, args.note)
            .await?;
        println!("✓ Conflict resolved\n");
        print_record(&record);
        return Ok(());
    }

    if let Some(conflict_id) = args.reopen {
        let record = engine.reopen_conflict(conflict_id).await?;
        println!("✓ Conflict reopened as {}\n", record.id);
        print_record(&record);
        return Ok(());
    }

    // Default: list
    let mut filter = ConflictFilter::default();
    if let Some(status) = &args.status {
        filter.status = Some(parse_status(status)?);
    }
    let records = engine.conflicts(&filter).await;

    if records.is_empty() {
        println!("No conflicts match.");
        return Ok(());
    }

    println!("\n=== Conflicts ({}) ===\n", records.len());
    for record in &records {
        print_record(record);
        println!();
    }

    Ok(())
}
