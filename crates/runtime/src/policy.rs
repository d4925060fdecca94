//! The trusted-schema namespace policy.
//!
//! Before any deck code runs, the orchestrator walks the deck's parent
//! directories for a workspace config file. A config whose `imports`
//! table remaps the reserved schema namespace to a local path would let a
//! workspace shadow the trusted schema module, so it is rejected with a
//! trust-boundary error.

use std::path::Path;

use serde_json::Value;

use gambit_domain::error::{Result, RunError};

/// The reserved import namespace decks resolve schema modules from.
pub const TRUSTED_SCHEMA_NAMESPACE: &str = "@gambit/schema";

/// Workspace config file name searched for in parent directories.
pub const WORKSPACE_CONFIG_FILE: &str = "gambit.json";

/// Walk parent directories of `deck_path` and fail if any workspace
/// config maps the reserved namespace. Unreadable or malformed configs
/// are skipped; virtual deck paths with no on-disk parents pass.
pub fn enforce_trusted_schema_namespace(deck_path: &str) -> Result<()> {
    let mut dir = Path::new(deck_path).parent();

    while let Some(current) = dir {
        let config_path = current.join(WORKSPACE_CONFIG_FILE);
        if let Ok(raw) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = serde_json::from_str::<Value>(&raw) {
                if let Some(imports) = config.get("imports").and_then(Value::as_object) {
                    if let Some(key) = imports
                        .keys()
                        .find(|k| k.starts_with(TRUSTED_SCHEMA_NAMESPACE))
                    {
                        return Err(RunError::Policy(format!(
                            "workspace config '{}' remaps the trusted namespace '{key}'",
                            config_path.display()
                        )));
                    }
                }
            }
        }
        dir = current.parent();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn virtual_paths_pass() {
        assert!(enforce_trusted_schema_namespace("/no/such/dir/deck.md").is_ok());
    }

    #[test]
    fn benign_imports_pass() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(WORKSPACE_CONFIG_FILE),
            r#"{"imports": {"utils/": "./lib/"}}"#,
        )
        .unwrap();
        let deck = tmp.path().join("deck.md");
        assert!(enforce_trusted_schema_namespace(deck.to_str().unwrap()).is_ok());
    }

    #[test]
    fn namespace_shadow_is_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(WORKSPACE_CONFIG_FILE),
            r#"{"imports": {"@gambit/schema": "./evil/schema.ts"}}"#,
        )
        .unwrap();
        let deck = tmp.path().join("nested");
        std::fs::create_dir(&deck).unwrap();
        let deck = deck.join("deck.md");

        let err = enforce_trusted_schema_namespace(deck.to_str().unwrap()).unwrap_err();
        match err {
            RunError::Policy(msg) => assert!(msg.contains("@gambit/schema")),
            other => panic!("expected policy error, got {other:?}"),
        }
    }

    #[test]
    fn prefixed_namespace_keys_are_caught() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(WORKSPACE_CONFIG_FILE),
            r#"{"imports": {"@gambit/schema/v2/": "./local/"}}"#,
        )
        .unwrap();
        let deck = tmp.path().join("deck.md");
        assert!(enforce_trusted_schema_namespace(deck.to_str().unwrap()).is_err());
    }

    #[test]
    fn malformed_config_is_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(WORKSPACE_CONFIG_FILE), "{not json").unwrap();
        let deck = tmp.path().join("deck.md");
        assert!(enforce_trusted_schema_namespace(deck.to_str().unwrap()).is_ok());
    }
}
