//! Numbered SQL migrations with a `schema_migrations` bookkeeping table.

use std::fs;
use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::{GraphweldError, Result};

struct Migration {
    version: u32,
    name: String,
    sql: String,
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

pub fn applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

/// Load `NNN_name.sql` files from a directory, ordered by version.
fn load_migrations(dir: &Path) -> Result<Vec<Migration>> {
    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    files.sort_by_key(|e| e.file_name());

    let mut migrations = Vec::new();
    for entry in files {
        let path = entry.path();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| GraphweldError::Config("invalid migration filename".to_string()))?;
        let version: u32 = filename
            .split('_')
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                GraphweldError::Config(format!("migration {} has no numeric prefix", filename))
            })?;
        migrations.push(Migration {
            version,
            name: filename.trim_end_matches(".sql").to_string(),
            sql: fs::read_to_string(&path)?,
        });
    }
    migrations.sort_by_key(|m| m.version);
    Ok(migrations)
}

/// Apply every pending migration, each in its own transaction.
pub fn run_migrations(conn: &mut Connection, dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;
    let applied = applied_migrations(conn)?;

    for migration in load_migrations(dir)? {
        if applied.contains(&migration.name) {
            log::debug!("migration {} already applied", migration.name);
            continue;
        }
        log::info!("applying migration {}", migration.name);
        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            GraphweldError::Config(format!("migration {} failed: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }
    Ok(())
}
