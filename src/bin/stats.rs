use clap::Parser;
use graphweld::{analyzer::Measure, config::Config, engine::ConsolidationEngine, store::SqliteStore};
use std::path::Path;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "stats")]
#[command(about = "Graph statistics and a centrality report")]
struct Args {
    /// Centrality measure for the ranking table
    #[arg(long, default_value = "degree")]
    measure: Measure,
    /// How many entities to rank
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load()?;
    let store = SqliteStore::open(&config.engine.db_path, Path::new("migrations")).await?;
    let engine = ConsolidationEngine::open(config, Arc::new(store)).await?;

    let stats = engine.stats().await;

    println!("\n=== Graphweld Consolidation Statistics ===\n");

    println!("{:-<60}", "");
    println!("{:<30} {:>28}", "Metric", "Value");
    println!("{:-<60}", "");
    println!("{:<30} {:>28}", "Live entities", stats.live_entities);
    println!("{:<30} {:>28}", "Tombstones (merged away)", stats.tombstones);
    println!("{:<30} {:>28}", "Relationships", stats.relationships);
    println!("{:<30} {:>28}", "Ledger entries", stats.ledger_entries);
    println!("{:<30} {:>28}", "Open conflicts", stats.open_conflicts);
    println!("{:<30} {:>28}", "Total conflicts", stats.total_conflicts);
    println!("{:<30} {:>28}", "Graph revision", stats.revision);
    println!("{:-<60}", "");

    println!("\nBlock Index:");
    println!("  Blocks: {}", stats.blocks);
    println!("  Postings: {}", stats.block_postings);
    println!("  Largest block: {}", stats.max_block_size);

    if stats.live_entities == 0 {
        println!("\nGraph is empty. Run ingest to consolidate some mentions.");
        return Ok(());
    }

    let ranking = engine.centrality(args.measure).await;
    let top_n = args.limit.min(ranking.len());

    println!(
        "\nTop {} Entities by {} Centrality:\n",
        top_n,
        capitalize(&args.measure.to_string())
    );
    println!("{:-<80}", "");
    println!("{:<38} {:<24} {:>8} {:>8}", "Entity", "Value", "Type", "Score");
    println!("{:-<80}", "");

    for (id, score) in ranking.iter().take(top_n) {
        let (value, entity_type) = match engine.entity(*id).await {
            Some(entity) => (entity.value, entity.entity_type),
            None => ("<unknown>".to_string(), String::new()),
        };
        println!("{:<38} {:<24} {:>8} {:>8.4}", id, value, entity_type, score);
    }
    println!("{:-<80}", "");

    println!();

    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
