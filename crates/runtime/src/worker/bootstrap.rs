//! Worker capability derivation.
//!
//! The bootstrap read allowlist is the only widening a worker ever sees:
//! the deck's import graph (syntactic scan only), plus host-trusted
//! directories. Untrusted imports resolving outside the effective read
//! scope are refused, and run/net/env grants never widen.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gambit_domain::error::{Result, RunError};
use gambit_permissions::{canonicalize_lenient, EffectivePermissions, Scope};

use crate::options::DeckLoader;

fn deck_dir(deck_path: &str) -> Option<PathBuf> {
    Path::new(deck_path).parent().map(Path::to_path_buf)
}

fn entry(path: &Path) -> String {
    canonicalize_lenient(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Derive the capability set a worker runs under: the effective set with
/// the bootstrap read allowlist added. Imports that fall outside the
/// effective read scope, the deck's own directory, and the host's trusted
/// directories are refused.
pub(crate) fn derive_worker_permissions(
    effective: &EffectivePermissions,
    deck_path: &str,
    loader: &Arc<dyn DeckLoader>,
    trusted_dirs: &[PathBuf],
) -> Result<EffectivePermissions> {
    let dir = deck_dir(deck_path);
    let imports = loader.import_graph(deck_path);

    let in_trusted = |p: &Path| -> bool {
        let canonical = canonicalize_lenient(p).unwrap_or_else(|_| p.to_path_buf());
        trusted_dirs
            .iter()
            .chain(dir.iter())
            .any(|t| {
                canonicalize_lenient(t)
                    .map(|ct| canonical.starts_with(ct))
                    .unwrap_or(false)
            })
    };

    let mut bootstrap_reads: BTreeSet<String> = BTreeSet::new();
    if let Some(dir) = dir.as_ref() {
        bootstrap_reads.insert(entry(dir));
    }
    for trusted in trusted_dirs {
        bootstrap_reads.insert(entry(trusted));
    }
    for import in &imports {
        let display = import.to_string_lossy();
        if !in_trusted(import) && !effective.can_read_path(&display) {
            return Err(RunError::Permission(format!(
                "untrusted import '{display}' resolves outside the effective read scope"
            )));
        }
        bootstrap_reads.insert(entry(import));
    }

    let mut derived = effective.clone();
    derived.read = match &effective.read {
        Scope::All => Scope::All,
        Scope::Set(existing) => {
            let mut widened = existing.clone();
            widened.extend(bootstrap_reads);
            Scope::Set(widened)
        }
    };
    // write/run/net/env never widen.
    Ok(derived)
}

/// The minimal set a deck-inspection worker runs under: reads limited to
/// the deck's directory and its bootstrap graph, nothing else granted.
pub(crate) fn inspection_permissions(
    deck_path: &str,
    loader: &Arc<dyn DeckLoader>,
    base_dir: &Path,
) -> EffectivePermissions {
    let mut reads: BTreeSet<String> = BTreeSet::new();
    if let Some(dir) = deck_dir(deck_path) {
        reads.insert(entry(&dir));
    }
    for import in loader.import_graph(deck_path) {
        reads.insert(entry(&import));
    }

    let mut perms = EffectivePermissions::deny_all(base_dir);
    perms.read = Scope::Set(reads);
    perms
}
