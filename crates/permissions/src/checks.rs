//! Path, run, and command checks against an effective permission set.
//!
//! Read/write checks canonicalize through the host filesystem — including
//! targets that do not exist yet, by canonicalizing the nearest existing
//! ancestor and reapplying the suffix — then require the target to equal
//! or descend from a granted root. Run checks are stricter: the grant is
//! an exact resolved binary, so any symlink on either side is refused.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::effective::EffectivePermissions;
use crate::scope::{RunScope, Scope};

/// Collapse `.` and `..` components without touching the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Canonicalize a path that may not exist: walk up to the nearest existing
/// ancestor, canonicalize it, then reapply the remaining components.
pub fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    if path.exists() {
        return path.canonicalize();
    }

    let mut existing = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match existing.parent() {
            Some(parent) => {
                if let Some(file_name) = existing.file_name() {
                    tail.push(file_name);
                }
                existing = parent;
            }
            None => break,
        }
    }

    let mut resolved = existing.canonicalize()?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(lexical_normalize(&resolved))
}

fn resolve_target(base: &Path, target: &str) -> PathBuf {
    let p = Path::new(target);
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    };
    lexical_normalize(&absolute)
}

fn scope_allows_path(scope: &Scope, base: &Path, target: &str) -> bool {
    let roots = match scope {
        Scope::All => return true,
        Scope::Set(roots) => roots,
    };

    let Ok(canonical_target) = canonicalize_lenient(&resolve_target(base, target)) else {
        return false;
    };

    roots.iter().any(|root| {
        canonicalize_lenient(Path::new(root))
            .map(|canonical_root| canonical_target.starts_with(&canonical_root))
            .unwrap_or(false)
    })
}

impl EffectivePermissions {
    /// Whether `target` (resolved against `base_dir`) is equal to or a
    /// descendant of a granted read root, after canonicalization.
    pub fn can_read_path(&self, target: &str) -> bool {
        scope_allows_path(&self.read, self.base_dir(), target)
    }

    /// As [`Self::can_read_path`], against the write scope.
    pub fn can_write_path(&self, target: &str) -> bool {
        scope_allows_path(&self.write, self.base_dir(), target)
    }

    /// Exact resolved-binary grant. The target must exist, resolve to
    /// itself (no symlink mediation), and equal a granted path that also
    /// resolves to itself.
    pub fn can_run_path(&self, target: &str) -> bool {
        let paths = match &self.run {
            RunScope::All => return true,
            RunScope::Grants { paths, .. } => paths,
        };

        let resolved_target = resolve_target(self.base_dir(), target);
        let Ok(canonical_target) = resolved_target.canonicalize() else {
            return false;
        };
        if canonical_target != resolved_target {
            return false;
        }

        paths.iter().any(|allowed| {
            let resolved_allowed = resolve_target(self.base_dir(), allowed);
            match resolved_allowed.canonicalize() {
                Ok(canonical_allowed) => {
                    canonical_allowed == resolved_allowed && canonical_target == canonical_allowed
                }
                Err(_) => false,
            }
        })
    }

    /// Exact match against the command grant set: no PATH search, no
    /// basename fallback.
    pub fn can_run_command(&self, name: &str) -> bool {
        match &self.run {
            RunScope::All => true,
            RunScope::Grants { commands, .. } => commands.contains(name),
        }
    }

    /// Exact-member check against the env scope.
    pub fn can_read_env(&self, name: &str) -> bool {
        self.env.contains(name)
    }

    /// Exact-member check against the net scope.
    pub fn can_reach_host(&self, host: &str) -> bool {
        self.net.contains(host)
    }
}
