//! Built-in tools: permission-gated filesystem and exec primitives that
//! always answer with the uniform tool envelope.

pub mod defs;
pub mod exec;
pub mod fs_tools;

use serde_json::Value;

use gambit_domain::error::Result;
use gambit_domain::ToolEnvelope;
use gambit_permissions::EffectivePermissions;

pub use defs::{gated_definitions, BuiltinId};
pub use exec::ExecOptions;

/// Dispatch one built-in call. Argument and permission problems come back
/// as envelopes; only cancellation escapes as an error.
pub async fn dispatch_builtin(
    id: BuiltinId,
    arguments: &Value,
    perms: &EffectivePermissions,
    exec_opts: &ExecOptions,
) -> Result<ToolEnvelope> {
    match id {
        BuiltinId::ReadFile => match serde_json::from_value(arguments.clone()) {
            Ok(req) => Ok(fs_tools::read_file(perms, req).await),
            Err(e) => Ok(ToolEnvelope::invalid_input(format!(
                "read_file arguments: {e}"
            ))),
        },
        BuiltinId::ListDir => match serde_json::from_value(arguments.clone()) {
            Ok(req) => Ok(fs_tools::list_dir(perms, req).await),
            Err(e) => Ok(ToolEnvelope::invalid_input(format!(
                "list_dir arguments: {e}"
            ))),
        },
        BuiltinId::GrepFiles => match serde_json::from_value(arguments.clone()) {
            Ok(req) => Ok(fs_tools::grep_files(perms, req).await),
            Err(e) => Ok(ToolEnvelope::invalid_input(format!(
                "grep_files arguments: {e}"
            ))),
        },
        BuiltinId::ApplyPatch => match serde_json::from_value(arguments.clone()) {
            Ok(req) => Ok(fs_tools::apply_patch(perms, req).await),
            Err(e) => Ok(ToolEnvelope::invalid_input(format!(
                "apply_patch arguments: {e}"
            ))),
        },
        BuiltinId::Exec => match serde_json::from_value(arguments.clone()) {
            Ok(req) => exec::exec(perms, req, exec_opts).await,
            Err(e) => Ok(ToolEnvelope::invalid_input(format!("exec arguments: {e}"))),
        },
    }
}
