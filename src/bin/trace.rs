use clap::Parser;
use graphweld::engine::ConsolidationEngine;
use graphweld::ledger::{LedgerEntry, LedgerOp};
use graphweld::model::SubjectId;
use graphweld::store::SqliteStore;
use graphweld::Config;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "trace")]
#[command(about = "Print the full provenance history of an entity or relationship")]
struct Args {
    /// Entity or relationship id
    #[arg(long)]
    id: Uuid,
}

/// One-line description of what an entry recorded.
fn describe(op: &LedgerOp) -> String {
    match op {
        LedgerOp::EntityCreated { entity_type, value } => {
            format!("{} '{}'", entity_type, value)
        }
        LedgerOp::RelationshipCreated {
            rel_type,
            source,
            target,
        } => format!("{}: {} -> {}", rel_type, source, target),
        LedgerOp::MentionAttached {
            mention_id,
            tentative,
            surface,
            ..
        } => {
            let mut s = format!("mention {}", mention_id);
            if let Some(surface) = surface {
                s.push_str(&format!(" '{}'", surface));
            }
            if *tentative {
                s.push_str(" (tentative)");
            }
            s
        }
        LedgerOp::AttributeAsserted { attribute, value } => {
            format!("{} = {}", attribute, value)
        }
        LedgerOp::Merged { absorbed } => format!("absorbed {} entities", absorbed.len()),
        LedgerOp::ConflictReopened { attribute, .. } => {
            format!("reopened dispute on '{}'", attribute)
        }
    }
}

fn print_entries(entries: &[LedgerEntry]) {
    println!("{:-<100}", "");
    println!(
        "{:<5} {:<20} {:<20} {:<14} {:>5}  {}",
        "Seq", "Timestamp", "Operation", "Source", "Conf", "Detail"
    );
    println!("{:-<100}", "");
    for entry in entries {
        let mut detail = describe(&entry.op);
        if let Some(prior) = entry.supersedes {
            detail.push_str(&format!(" [corrects {}]", prior));
        }
        println!(
            "{:<5} {:<20} {:<20} {:<14} {:>5.2}  {}",
            entry.seq,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.op.name(),
            entry.source_id,
            entry.confidence,
            detail
        );
    }
    println!("{:-<100}", "");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load()?;
    let store = SqliteStore::open(&config.engine.db_path, Path::new("migrations")).await?;
    let engine = ConsolidationEngine::open(config, Arc::new(store)).await?;

    // A bare uuid could name either kind of subject; try entity first
    let mut entries = engine.trace(SubjectId::Entity(args.id)).await;
    let mut kind = "entity";
    if entries.is_empty() {
        entries = engine.trace(SubjectId::Relationship(args.id)).await;
        kind = "relationship";
    }

    if entries.is_empty() {
        println!("No ledger entries for subject {}.", args.id);
        return Ok(());
    }

    if let Some(entity) = engine.entity(args.id).await {
        println!("\n=== Provenance: {} '{}' ({}) ===", entity.entity_type, entity.value, entity.id);
        if entity.id != args.id {
            println!("(id {} was merged into {})", args.id, entity.id);
        }
    } else {
        println!("\n=== Provenance: {} {} ===", kind, args.id);
    }
    println!("{} entries\n", entries.len());

    print_entries(&entries);
    println!();

    Ok(())
}
