use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use super::{load_snapshot, project_root};
use crate::config::Config;
use crate::index::Repository;

pub async fn show_stats(project: String, verbose: bool) -> Result<()> {
    let root = project_root(&project)?;
    let config = Config::from_project_dir(&root);
    let (store, snapshot) = load_snapshot(&root, &config)?;
    let created_at = snapshot.created_at;
    let repo = Repository::from_snapshot(snapshot);
    let stats = repo.stats();

    println!("phpls statistics v{}", env!("CARGO_PKG_VERSION"));
    println!("Project: {}", root.display());

    println!("\nIndex Statistics:");
    println!("  Files: {}", stats.files);
    println!("  Namespaces: {}", stats.namespaces);
    println!("  Symbols: {}", stats.symbols);
    println!("  Definitions: {}", stats.definitions);
    println!("  References: {}", stats.references);
    println!("  Duplicate declarations: {}", stats.conflicts);
    println!("  Created: {}", created_at.to_rfc3339());
    println!("  Index size: {:.2} MB", db_size(store.path())?);

    if verbose {
        let query = repo.query();
        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for definition in query.definitions() {
            *by_kind.entry(definition.kind.as_str()).or_default() += 1;
        }
        println!("\nDefinitions by kind:");
        for (kind, count) in by_kind {
            println!("  {}: {}", kind, count);
        }

        let broken: Vec<&str> = query
            .files()
            .filter(|file| file.has_errors)
            .map(|file| file.uri.as_str())
            .collect();
        if !broken.is_empty() {
            println!("\nFiles with syntax errors:");
            for uri in broken {
                println!("  {}", uri);
            }
        }

        let mut slowest: Vec<(&str, u64)> = query
            .files()
            .map(|file| (file.uri.as_str(), file.parse_duration_ms))
            .collect();
        slowest.sort_by(|a, b| b.1.cmp(&a.1));
        println!("\nSlowest files:");
        for (uri, ms) in slowest.into_iter().take(5) {
            println!("  {} ms  {}", ms, uri);
        }
    }

    Ok(())
}

fn db_size(path: &Path) -> Result<f64> {
    let size_bytes = std::fs::metadata(path)?.len() as f64;
    Ok(size_bytes / (1024.0 * 1024.0))
}
