use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::server::serve_stdio;

/// Run the language server on stdio. Returns the process exit status.
pub async fn serve(project: Option<String>) -> Result<i32> {
    // Used only when the client does not name a workspace root
    let defaults = match &project {
        Some(project) => Config::from_project_dir(project),
        None => Config::default(),
    };

    info!("phpls {} listening on stdio", env!("CARGO_PKG_VERSION"));
    let code = serve_stdio(defaults).await?;
    info!("Language server exiting with status {}", code);
    Ok(code)
}
