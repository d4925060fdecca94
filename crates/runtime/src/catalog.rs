//! Per-pass tool catalog: the definitions advertised to the model and the
//! dispatch table behind them.
//!
//! Lookup layers, in order: built-ins (gated by permissions), internal
//! respond/end tools, action decks, external tools. Externals that
//! collide with a built-in or an action are silently dropped; an action
//! colliding with a built-in is a declaration error.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use gambit_domain::deck::{ActionDeckRef, ExternalToolDef};
use gambit_domain::error::{Result, RunError};
use gambit_domain::{schema, Deck, ToolDefinition};
use gambit_permissions::EffectivePermissions;
use gambit_tools::{gated_definitions, BuiltinId};

use crate::options::DeckLoader;

/// Internal tools the runtime itself services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalTool {
    /// Completes a `respond` deck with a validated payload envelope.
    Respond,
    /// Terminal end signal (requires `allow_end`).
    End,
    /// Synthetic input-injection exchange; never advertised.
    Context,
    /// Synthetic action-envelope echo; never advertised.
    Complete,
}

impl InternalTool {
    pub fn name(self) -> &'static str {
        match self {
            InternalTool::Respond => "gambit_respond",
            InternalTool::End => "gambit_end",
            InternalTool::Context => "gambit_context",
            InternalTool::Complete => "gambit_complete",
        }
    }
}

/// One resolved tool name.
#[derive(Clone)]
pub enum ToolBinding {
    Builtin(BuiltinId),
    Internal(InternalTool),
    Action {
        reference: ActionDeckRef,
        /// The child deck, loaded once for its schemas.
        deck: Arc<Deck>,
    },
    External(ExternalToolDef),
}

/// The catalog for one pass.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    pub definitions: Vec<ToolDefinition>,
    bindings: HashMap<String, ToolBinding>,
}

impl ToolCatalog {
    pub fn lookup(&self, name: &str) -> Option<&ToolBinding> {
        self.bindings.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.name.clone()).collect()
    }
}

fn respond_definition(deck: &Deck) -> ToolDefinition {
    let payload_schema = deck
        .response_schema
        .clone()
        .unwrap_or_else(schema::permissive_object);
    ToolDefinition {
        name: InternalTool::Respond.name().into(),
        description: "Complete this deck with a response payload.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "payload": payload_schema,
                "status": { "type": "integer", "description": "HTTP-style status (default 200)" },
                "message": { "type": "string" },
                "code": { "type": "string" },
                "meta": { "type": "object" }
            },
            "required": ["payload"]
        }),
    }
}

fn end_definition() -> ToolDefinition {
    ToolDefinition {
        name: InternalTool::End.name().into(),
        description: "End the conversation. The payload is passed through to the caller.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "payload": {}
            }
        }),
    }
}

/// Reject action names that shadow built-ins or internal tools.
pub fn check_action_names(deck: &Deck) -> Result<()> {
    for action in &deck.action_decks {
        let collides_builtin = BuiltinId::from_name(&action.name).is_some();
        let collides_internal = [
            InternalTool::Respond,
            InternalTool::End,
            InternalTool::Context,
            InternalTool::Complete,
        ]
        .iter()
        .any(|t| t.name() == action.name);
        if collides_builtin || collides_internal {
            return Err(RunError::Validation(format!(
                "action '{}' collides with a built-in tool name",
                action.name
            )));
        }
    }
    Ok(())
}

/// Assemble the catalog for one pass. Loads each action's child deck for
/// its context schema (the action tool's parameters).
pub async fn build_catalog(
    deck: &Deck,
    perms: &EffectivePermissions,
    loader: &Arc<dyn DeckLoader>,
) -> Result<ToolCatalog> {
    let mut catalog = ToolCatalog::default();

    for (id, definition) in gated_definitions(perms) {
        catalog.bindings.insert(definition.name.clone(), ToolBinding::Builtin(id));
        catalog.definitions.push(definition);
    }

    if deck.respond {
        let definition = respond_definition(deck);
        catalog
            .bindings
            .insert(definition.name.clone(), ToolBinding::Internal(InternalTool::Respond));
        catalog.definitions.push(definition);
    }
    if deck.allow_end {
        let definition = end_definition();
        catalog
            .bindings
            .insert(definition.name.clone(), ToolBinding::Internal(InternalTool::End));
        catalog.definitions.push(definition);
    }

    for action in &deck.action_decks {
        let child = loader.load(&action.path).await?;
        let parameters = child
            .context_schema
            .clone()
            .unwrap_or_else(schema::permissive_object);
        catalog.definitions.push(ToolDefinition {
            name: action.name.clone(),
            description: format!("Invoke the '{}' action deck.", action.name),
            parameters,
        });
        catalog.bindings.insert(
            action.name.clone(),
            ToolBinding::Action {
                reference: action.clone(),
                deck: child,
            },
        );
    }

    for external in &deck.external_tools {
        // Shadowing: actions and built-ins win; identically named
        // externals are dropped without surfacing.
        if catalog.bindings.contains_key(&external.name) {
            tracing::debug!(tool = %external.name, "external tool shadowed, dropping");
            continue;
        }
        catalog.definitions.push(ToolDefinition {
            name: external.name.clone(),
            description: external
                .description
                .clone()
                .unwrap_or_else(|| format!("External tool '{}'.", external.name)),
            parameters: external
                .input_schema
                .clone()
                .unwrap_or_else(schema::permissive_object),
        });
        catalog
            .bindings
            .insert(external.name.clone(), ToolBinding::External(external.clone()));
    }

    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StaticDeckSet;
    use gambit_domain::grants::{GrantSpec, PermissionSpec};
    use std::path::Path;

    fn read_perms() -> EffectivePermissions {
        EffectivePermissions::from_spec(
            &PermissionSpec {
                read: Some(GrantSpec::All),
                ..PermissionSpec::default()
            },
            Path::new("/"),
        )
    }

    fn child_deck(path: &str) -> Deck {
        let mut deck = Deck::new(path);
        deck.context_schema = Some(json!({"type": "object"}));
        deck.response_schema = Some(json!({"type": "string"}));
        deck
    }

    #[tokio::test]
    async fn catalog_gates_builtins_and_adds_actions() {
        let mut deck = Deck::new("root.deck");
        deck.action_decks.push(ActionDeckRef {
            name: "compute".into(),
            path: "child.deck".into(),
            permissions: None,
        });
        let loader: Arc<dyn DeckLoader> =
            Arc::new(StaticDeckSet::new().with(child_deck("child.deck")));

        let catalog = build_catalog(&deck, &read_perms(), &loader).await.unwrap();
        let names = catalog.tool_names();
        assert!(names.contains(&"read_file".to_string()));
        assert!(names.contains(&"compute".to_string()));
        assert!(!names.contains(&"apply_patch".to_string()));
        assert!(!names.contains(&"exec".to_string()));
        assert!(matches!(
            catalog.lookup("compute"),
            Some(ToolBinding::Action { .. })
        ));
    }

    #[tokio::test]
    async fn respond_and_end_follow_flags() {
        let mut deck = Deck::new("root.deck");
        deck.respond = true;
        deck.allow_end = true;
        deck.response_schema = Some(json!({"type": "string"}));
        let loader: Arc<dyn DeckLoader> = Arc::new(StaticDeckSet::new());

        let catalog = build_catalog(
            &deck,
            &EffectivePermissions::deny_all("/"),
            &loader,
        )
        .await
        .unwrap();
        let names = catalog.tool_names();
        assert_eq!(names, vec!["gambit_respond", "gambit_end"]);
    }

    #[tokio::test]
    async fn external_colliding_with_action_is_dropped() {
        let mut deck = Deck::new("root.deck");
        deck.action_decks.push(ActionDeckRef {
            name: "lookup".into(),
            path: "child.deck".into(),
            permissions: None,
        });
        deck.external_tools.push(ExternalToolDef {
            name: "lookup".into(),
            description: None,
            input_schema: None,
        });
        deck.external_tools.push(ExternalToolDef {
            name: "fetch".into(),
            description: None,
            input_schema: None,
        });
        let loader: Arc<dyn DeckLoader> =
            Arc::new(StaticDeckSet::new().with(child_deck("child.deck")));

        let catalog = build_catalog(&deck, &EffectivePermissions::deny_all("/"), &loader)
            .await
            .unwrap();
        assert!(matches!(
            catalog.lookup("lookup"),
            Some(ToolBinding::Action { .. })
        ));
        assert!(matches!(
            catalog.lookup("fetch"),
            Some(ToolBinding::External(_))
        ));
    }

    #[test]
    fn action_shadowing_builtin_is_rejected() {
        let mut deck = Deck::new("root.deck");
        deck.action_decks.push(ActionDeckRef {
            name: "exec".into(),
            path: "child.deck".into(),
            permissions: None,
        });
        assert!(matches!(
            check_action_names(&deck),
            Err(RunError::Validation(_))
        ));
    }

    #[test]
    fn action_shadowing_internal_is_rejected() {
        let mut deck = Deck::new("root.deck");
        deck.action_decks.push(ActionDeckRef {
            name: "gambit_respond".into(),
            path: "child.deck".into(),
            permissions: None,
        });
        assert!(check_action_names(&deck).is_err());
    }
}
