use anyhow::{bail, Result};

use super::{load_snapshot, project_root};
use crate::config::Config;
use crate::index::{Range, Repository};

/// `definition` or `references` of an FQN, answered from the saved index
pub async fn query_index(query_type: String, fqn: String, project: String, format: String) -> Result<()> {
    if !matches!(format.as_str(), "json" | "text") {
        bail!("Unknown format: {} (expected json or text)", format);
    }
    let root = project_root(&project)?;
    let config = Config::from_project_dir(&root);
    let (_, snapshot) = load_snapshot(&root, &config)?;
    let repo = Repository::from_snapshot(snapshot);

    let results: Vec<(String, String, Range)> = match query_type.as_str() {
        "definition" => repo
            .get_definition(&fqn)
            .or_else(|| repo.get_inherited_definition(&fqn))
            .map(|definition| (definition.fqn, definition.uri, definition.range))
            .into_iter()
            .collect(),
        "references" => {
            let mut rows: Vec<_> = repo
                .references_to(&fqn)
                .into_iter()
                .map(|reference| (fqn.clone(), reference.uri, reference.range))
                .collect();
            rows.sort_by(|a, b| (&a.1, a.2.start).cmp(&(&b.1, b.2.start)));
            rows
        }
        other => bail!("Unknown query type: {} (expected definition or references)", other),
    };

    if format == "json" {
        let rows: Vec<serde_json::Value> = results
            .iter()
            .map(|(fqn, uri, range)| {
                serde_json::json!({
                    "fqn": fqn,
                    "uri": uri,
                    "line": range.start.line,
                    "character": range.start.character
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No {} found for '{}'", query_type, fqn);
        return Ok(());
    }
    for (fqn, uri, range) in &results {
        // Lines and columns shown one-based
        println!("{}:{}:{}  {}", uri, range.start.line + 1, range.start.character + 1, fqn);
    }
    Ok(())
}
