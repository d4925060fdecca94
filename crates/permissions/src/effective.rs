//! Effective permission sets and their layered resolution.
//!
//! Construction is a left-fold intersection over the applicable layers
//! (parent → workspace → declaration → reference → session); each
//! application is recorded as a [`PermissionLayerTrace`], and the result
//! is always a lower or equal bound of every input layer.

use std::path::{Path, PathBuf};

use gambit_domain::grants::{
    GrantSpec, PermissionLayer, PermissionLayerTrace, PermissionSpec, RunGrantSpec,
};

use crate::scope::{RunScope, Scope};

/// A fully resolved permission set for one invocation. Immutable once
/// computed; descent always creates a new set.
///
/// Relative path grants were resolved against `base_dir` at normalization
/// time, and built-in tools resolve their relative arguments against the
/// same `base_dir` (the root anchor, not the deck's own directory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePermissions {
    base_dir: PathBuf,
    pub read: Scope,
    pub write: Scope,
    pub net: Scope,
    pub env: Scope,
    pub run: RunScope,
}

fn resolve_entry(base: &Path, entry: &str) -> String {
    let p = Path::new(entry);
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    };
    crate::checks::lexical_normalize(&absolute)
        .to_string_lossy()
        .into_owned()
}

fn scope_from_grant(grant: Option<&GrantSpec>, base: &Path, paths: bool) -> Scope {
    match grant {
        None => Scope::none(),
        Some(GrantSpec::All) => Scope::All,
        Some(GrantSpec::Entries(entries)) => {
            if paths {
                Scope::from_entries(entries.iter().map(|e| resolve_entry(base, e)))
            } else {
                Scope::from_entries(entries.iter().cloned())
            }
        }
    }
}

impl EffectivePermissions {
    pub fn allow_all(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            read: Scope::All,
            write: Scope::All,
            net: Scope::All,
            env: Scope::All,
            run: RunScope::All,
        }
    }

    pub fn deny_all(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            read: Scope::none(),
            write: Scope::none(),
            net: Scope::none(),
            env: Scope::none(),
            run: RunScope::none(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Normalize a declared spec: path grants become absolute (resolved
    /// once against the spec's or the supplied base dir), net/env entries
    /// stay verbatim, absent scopes grant nothing.
    pub fn from_spec(spec: &PermissionSpec, default_base: &Path) -> Self {
        let base_dir = spec
            .base_dir
            .as_ref()
            .map_or_else(|| default_base.to_path_buf(), PathBuf::from);

        let run = match spec.run.as_ref() {
            None => RunScope::none(),
            Some(RunGrantSpec::All) => RunScope::All,
            Some(RunGrantSpec::Grants { paths, commands }) => RunScope::Grants {
                paths: paths.iter().map(|p| resolve_entry(&base_dir, p)).collect(),
                commands: commands.iter().cloned().collect(),
            },
        };

        Self {
            read: scope_from_grant(spec.read.as_ref(), &base_dir, true),
            write: scope_from_grant(spec.write.as_ref(), &base_dir, true),
            net: scope_from_grant(spec.net.as_ref(), &base_dir, false),
            env: scope_from_grant(spec.env.as_ref(), &base_dir, false),
            run,
            base_dir,
        }
    }

    /// The wire form, for layer traces and the worker protocol.
    pub fn to_spec(&self) -> PermissionSpec {
        PermissionSpec {
            base_dir: Some(self.base_dir.to_string_lossy().into_owned()),
            read: Some(self.read.to_spec()),
            write: Some(self.write.to_spec()),
            net: Some(self.net.to_spec()),
            env: Some(self.env.to_spec()),
            run: Some(self.run.to_spec()),
        }
    }

    /// Componentwise intersection, keeping the left side's anchor.
    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            base_dir: self.base_dir.clone(),
            read: self.read.intersect(&other.read),
            write: self.write.intersect(&other.write),
            net: self.net.intersect(&other.net),
            env: self.env.intersect(&other.env),
            run: self.run.intersect(&other.run),
        }
    }

    /// The monotonicity invariant: every component a subset of `other`'s.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.read.is_subset_of(&other.read)
            && self.write.is_subset_of(&other.write)
            && self.net.is_subset_of(&other.net)
            && self.env.is_subset_of(&other.env)
            && self.run.is_subset_of(&other.run)
    }
}

/// The layers applicable to one invocation, in application order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionLayers<'a> {
    /// The parent's effective set; `None` means a root invocation, which
    /// starts from host allow-all.
    pub parent: Option<&'a EffectivePermissions>,
    /// Process-wide policy (root only).
    pub workspace: Option<&'a PermissionSpec>,
    /// The deck's own declaration.
    pub declaration: Option<&'a PermissionSpec>,
    /// The parent's per-action-reference override (narrowing only).
    pub reference: Option<&'a PermissionSpec>,
    /// Ad-hoc user grants (root only).
    pub session: Option<&'a PermissionSpec>,
}

/// Left-fold intersection over the layers, emitting one trace entry per
/// application. The result is a subset of every input layer.
pub fn resolve(
    layers: PermissionLayers<'_>,
    base_dir: &Path,
) -> (EffectivePermissions, Vec<PermissionLayerTrace>) {
    let mut traces = Vec::new();

    let mut effective = match layers.parent {
        Some(parent) => parent.clone(),
        None => EffectivePermissions::allow_all(base_dir),
    };
    traces.push(PermissionLayerTrace {
        layer: PermissionLayer::Parent,
        requested: None,
        effective: effective.to_spec(),
    });

    let overlays = [
        (PermissionLayer::Workspace, layers.workspace),
        (PermissionLayer::Declaration, layers.declaration),
        (PermissionLayer::Reference, layers.reference),
        (PermissionLayer::Session, layers.session),
    ];

    for (layer, spec) in overlays {
        let Some(spec) = spec else { continue };
        let requested = EffectivePermissions::from_spec(spec, effective.base_dir());
        effective = effective.intersect(&requested);
        traces.push(PermissionLayerTrace {
            layer,
            requested: Some(spec.clone()),
            effective: effective.to_spec(),
        });
    }

    (effective, traces)
}
