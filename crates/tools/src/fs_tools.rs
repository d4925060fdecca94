//! Filesystem built-ins: `read_file`, `list_dir`, `grep_files`,
//! `apply_patch`.
//!
//! Paths resolve against the effective permission set's `base_dir`; every
//! denial is the standard `{status: 403, code: "permission_denied"}`
//! envelope. Nothing here escapes as an error — callers always get an
//! envelope back.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;
use tokio::fs;

use gambit_domain::ToolEnvelope;
use gambit_permissions::EffectivePermissions;

/// Default line window for `read_file`.
const READ_DEFAULT_LINES: usize = 400;
/// Default and hard cap for `list_dir` entries.
const LIST_DEFAULT_ENTRIES: usize = 200;
const LIST_MAX_ENTRIES: usize = 2000;
/// Default match cap for `grep_files`.
const GREP_DEFAULT_MATCHES: usize = 100;

fn resolve(perms: &EffectivePermissions, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        perms.base_dir().join(p)
    }
}

// ── read_file ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub end_line: Option<usize>,
}

pub async fn read_file(perms: &EffectivePermissions, req: ReadFileRequest) -> ToolEnvelope {
    if !perms.can_read_path(&req.path) {
        return ToolEnvelope::permission_denied(format!("no read grant covers '{}'", req.path));
    }

    let path = resolve(perms, &req.path);
    let content = match fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return ToolEnvelope::not_found(format!("'{}' does not exist", req.path));
        }
        Err(e) => {
            return ToolEnvelope::error(500, "read_failed", format!("reading '{}': {e}", req.path));
        }
    };

    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();

    let start_line = req.start_line.unwrap_or(1).max(1);
    let end_line = req
        .end_line
        .unwrap_or(start_line + READ_DEFAULT_LINES - 1)
        .min(total_lines);

    let sliced = if start_line > total_lines || end_line < start_line {
        String::new()
    } else {
        lines[start_line - 1..end_line].join("\n")
    };

    ToolEnvelope::ok(json!({
        "path": req.path,
        "start_line": start_line,
        "end_line": end_line,
        "total_lines": total_lines,
        "content": sliced,
    }))
}

// ── list_dir ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ListDirRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub max_entries: Option<usize>,
}

fn entry_type(path: &Path) -> &'static str {
    match path.symlink_metadata() {
        Ok(meta) if meta.file_type().is_symlink() => "symlink",
        Ok(meta) if meta.is_dir() => "dir",
        _ => "file",
    }
}

pub async fn list_dir(perms: &EffectivePermissions, req: ListDirRequest) -> ToolEnvelope {
    if !perms.can_read_path(&req.path) {
        return ToolEnvelope::permission_denied(format!("no read grant covers '{}'", req.path));
    }

    let max_entries = req
        .max_entries
        .unwrap_or(LIST_DEFAULT_ENTRIES)
        .min(LIST_MAX_ENTRIES);

    let root = resolve(perms, &req.path);
    let mut entries = Vec::new();
    let mut truncated = false;
    let mut pending = vec![root.clone()];

    while let Some(dir) = pending.pop() {
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if dir == root => {
                return ToolEnvelope::error(
                    500,
                    "list_failed",
                    format!("reading '{}': {e}", req.path),
                );
            }
            // Unreadable subdirectories are skipped silently.
            Err(_) => continue,
        };

        let mut children = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            children.push(entry.path());
        }
        children.sort();

        for child in children {
            let display = child.to_string_lossy().into_owned();
            // Entries without read access are skipped silently.
            if !perms.can_read_path(&display) {
                continue;
            }
            if entries.len() >= max_entries {
                truncated = true;
                break;
            }
            let kind = entry_type(&child);
            entries.push(json!({ "path": display, "type": kind }));
            if req.recursive && kind == "dir" {
                pending.push(child);
            }
        }
        if truncated {
            break;
        }
    }

    ToolEnvelope::ok(json!({
        "path": req.path,
        "entries": entries,
        "truncated": truncated,
    }))
}

// ── grep_files ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GrepFilesRequest {
    pub path: String,
    pub query: String,
    #[serde(default)]
    pub max_matches: Option<usize>,
}

pub async fn grep_files(perms: &EffectivePermissions, req: GrepFilesRequest) -> ToolEnvelope {
    if !perms.can_read_path(&req.path) {
        return ToolEnvelope::permission_denied(format!("no read grant covers '{}'", req.path));
    }

    let pattern = match regex::Regex::new(&req.query) {
        Ok(p) => p,
        Err(e) => {
            return ToolEnvelope::error(400, "invalid_regex", format!("'{}': {e}", req.query));
        }
    };

    let max_matches = req.max_matches.unwrap_or(GREP_DEFAULT_MATCHES);
    let root = resolve(perms, &req.path);

    let mut matches = Vec::new();
    let mut truncated = false;
    let mut pending = vec![root];

    'walk: while let Some(current) = pending.pop() {
        let display = current.to_string_lossy().into_owned();
        if !perms.can_read_path(&display) {
            continue;
        }

        if current.is_dir() {
            let Ok(mut read_dir) = fs::read_dir(&current).await else {
                continue;
            };
            let mut children = Vec::new();
            while let Ok(Some(entry)) = read_dir.next_entry().await {
                children.push(entry.path());
            }
            children.sort();
            // Stack order: reverse so the walk visits names in order.
            for child in children.into_iter().rev() {
                pending.push(child);
            }
            continue;
        }

        // Unreadable or non-text files are skipped.
        let Ok(content) = fs::read_to_string(&current).await else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if pattern.is_match(line) {
                if matches.len() >= max_matches {
                    truncated = true;
                    break 'walk;
                }
                matches.push(json!({
                    "path": display,
                    "line": idx + 1,
                    "text": line,
                }));
            }
        }
    }

    ToolEnvelope::ok(json!({
        "path": req.path,
        "query": req.query,
        "matches": matches,
        "truncated": truncated,
    }))
}

// ── apply_patch ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PatchEdit {
    pub old_text: String,
    pub new_text: String,
    #[serde(default)]
    pub replace_all: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyPatchRequest {
    pub path: String,
    pub edits: Vec<PatchEdit>,
    #[serde(default)]
    pub create_if_missing: bool,
}

pub async fn apply_patch(perms: &EffectivePermissions, req: ApplyPatchRequest) -> ToolEnvelope {
    if !perms.can_write_path(&req.path) {
        return ToolEnvelope::permission_denied(format!("no write grant covers '{}'", req.path));
    }

    let path = resolve(perms, &req.path);
    let exists = path.exists();

    if !exists && !req.create_if_missing {
        return ToolEnvelope::not_found(format!("'{}' does not exist", req.path));
    }

    let mut content = if exists {
        if !perms.can_read_path(&req.path) {
            return ToolEnvelope::permission_denied(format!(
                "no read grant covers existing '{}'",
                req.path
            ));
        }
        match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                return ToolEnvelope::error(
                    500,
                    "read_failed",
                    format!("reading '{}': {e}", req.path),
                );
            }
        }
    } else {
        String::new()
    };

    let mut applied = 0usize;
    for edit in &req.edits {
        if edit.replace_all {
            if content.contains(&edit.old_text) {
                content = content.replace(&edit.old_text, &edit.new_text);
                applied += 1;
            }
        } else if edit.old_text.is_empty() {
            // Empty needle: prepend, the replacen(…, 1) behavior.
            content.insert_str(0, &edit.new_text);
            applied += 1;
        } else if content.contains(&edit.old_text) {
            content = content.replacen(&edit.old_text, &edit.new_text, 1);
            applied += 1;
        }
    }

    if applied == 0 && !(req.create_if_missing && !exists) {
        return ToolEnvelope::error(409, "no_changes", "no edit matched the file content");
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            return ToolEnvelope::error(
                500,
                "write_failed",
                format!("creating parent of '{}': {e}", req.path),
            );
        }
    }
    if let Err(e) = fs::write(&path, &content).await {
        return ToolEnvelope::error(500, "write_failed", format!("writing '{}': {e}", req.path));
    }

    ToolEnvelope::ok(json!({
        "path": req.path,
        "applied": applied,
        "created": !exists,
    }))
}
