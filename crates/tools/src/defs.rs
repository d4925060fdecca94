//! Built-in tool identities and the definitions exposed to the model.
//!
//! A built-in is present in the catalog iff its required scope is
//! non-empty: the read tools behind `read`, `apply_patch` behind `write`,
//! `exec` behind `run`.

use gambit_domain::ToolDefinition;
use gambit_permissions::EffectivePermissions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinId {
    ReadFile,
    ListDir,
    GrepFiles,
    ApplyPatch,
    Exec,
}

impl BuiltinId {
    pub const ALL: [BuiltinId; 5] = [
        BuiltinId::ReadFile,
        BuiltinId::ListDir,
        BuiltinId::GrepFiles,
        BuiltinId::ApplyPatch,
        BuiltinId::Exec,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinId::ReadFile => "read_file",
            BuiltinId::ListDir => "list_dir",
            BuiltinId::GrepFiles => "grep_files",
            BuiltinId::ApplyPatch => "apply_patch",
            BuiltinId::Exec => "exec",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }

    /// Whether the effective set grants the scope this built-in requires.
    pub fn gated_on(self, perms: &EffectivePermissions) -> bool {
        match self {
            BuiltinId::ReadFile | BuiltinId::ListDir | BuiltinId::GrepFiles => {
                !perms.read.is_empty()
            }
            BuiltinId::ApplyPatch => !perms.write.is_empty(),
            BuiltinId::Exec => !perms.run.is_empty(),
        }
    }

    pub fn definition(self) -> ToolDefinition {
        match self {
            BuiltinId::ReadFile => ToolDefinition {
                name: "read_file".into(),
                description: "Read a text file, optionally sliced by line range.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File path" },
                        "start_line": { "type": "integer", "description": "First line to return (1-based)" },
                        "end_line": { "type": "integer", "description": "Last line to return (inclusive)" }
                    },
                    "required": ["path"]
                }),
            },
            BuiltinId::ListDir => ToolDefinition {
                name: "list_dir".into(),
                description: "List directory entries, optionally recursively.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Directory path" },
                        "recursive": { "type": "boolean", "description": "Descend into subdirectories" },
                        "max_entries": { "type": "integer", "description": "Entry cap (default 200, max 2000)" }
                    },
                    "required": ["path"]
                }),
            },
            BuiltinId::GrepFiles => ToolDefinition {
                name: "grep_files".into(),
                description: "Search files under a path with a regular expression.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File or directory to search" },
                        "query": { "type": "string", "description": "Regular expression" },
                        "max_matches": { "type": "integer", "description": "Match cap" }
                    },
                    "required": ["path", "query"]
                }),
            },
            BuiltinId::ApplyPatch => ToolDefinition {
                name: "apply_patch".into(),
                description: "Apply sequential text edits to a file, optionally creating it.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File path" },
                        "edits": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "old_text": { "type": "string" },
                                    "new_text": { "type": "string" },
                                    "replace_all": { "type": "boolean" }
                                },
                                "required": ["old_text", "new_text"]
                            }
                        },
                        "create_if_missing": { "type": "boolean" }
                    },
                    "required": ["path", "edits"]
                }),
            },
            BuiltinId::Exec => ToolDefinition {
                name: "exec".into(),
                description: "Run a granted command and capture its output.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "Command name or executable path" },
                        "args": { "type": "array", "items": { "type": "string" } },
                        "cwd": { "type": "string", "description": "Working directory" },
                        "timeout_ms": { "type": "integer", "description": "Soft timeout, clamped to the run deadline" }
                    },
                    "required": ["command"]
                }),
            },
        }
    }
}

/// The built-ins the effective permission set admits, catalog-ready.
pub fn gated_definitions(perms: &EffectivePermissions) -> Vec<(BuiltinId, ToolDefinition)> {
    BuiltinId::ALL
        .into_iter()
        .filter(|id| id.gated_on(perms))
        .map(|id| (id, id.definition()))
        .collect()
}
