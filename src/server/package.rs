// composer.json package metadata

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Name and version of the project's own package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PackageDescriptor {
    /// Read `composer.json` under `root`. A missing or nameless manifest gives `None`.
    pub fn load(root: &Path) -> Option<Self> {
        let path = root.join("composer.json");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                debug!("No package manifest at {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<PackageDescriptor>(&content) {
            Ok(package) => Some(package),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_composer_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(PackageDescriptor::load(dir.path()).is_none());

        std::fs::write(
            dir.path().join("composer.json"),
            r#"{"name": "acme/shop", "version": "1.2.0", "require": {"php": ">=8.1"}}"#,
        )
        .unwrap();
        assert_eq!(
            PackageDescriptor::load(dir.path()),
            Some(PackageDescriptor {
                name: "acme/shop".to_string(),
                version: Some("1.2.0".to_string()),
            })
        );

        std::fs::write(dir.path().join("composer.json"), r#"{"require": {}}"#).unwrap();
        assert!(PackageDescriptor::load(dir.path()).is_none());
    }
}
