//! Wire-form permission declarations.
//!
//! A [`PermissionSpec`] is what decks, action references, workspace policy,
//! and session grants declare. The permission engine normalizes these into
//! effective scopes; this module only defines the serde shapes so that the
//! deck model, trace events, and worker protocol can carry them.

use serde::{Deserialize, Serialize};

/// A single scope grant: everything, or an explicit entry set.
///
/// Serialized as the string `"all"` or an array of entries — path grants
/// for read/write, host or variable names for net/env.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GrantWire", into = "GrantWire")]
pub enum GrantSpec {
    All,
    Entries(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum GrantWire {
    Literal(String),
    Entries(Vec<String>),
}

impl TryFrom<GrantWire> for GrantSpec {
    type Error = String;

    fn try_from(wire: GrantWire) -> Result<Self, Self::Error> {
        match wire {
            GrantWire::Literal(s) if s == "all" => Ok(GrantSpec::All),
            GrantWire::Literal(s) => Err(format!("unknown scope literal '{s}' (expected \"all\")")),
            GrantWire::Entries(e) => Ok(GrantSpec::Entries(e)),
        }
    }
}

impl From<GrantSpec> for GrantWire {
    fn from(spec: GrantSpec) -> Self {
        match spec {
            GrantSpec::All => GrantWire::Literal("all".into()),
            GrantSpec::Entries(e) => GrantWire::Entries(e),
        }
    }
}

/// The run scope: everything, or executable-path plus bare-command grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RunGrantWire", into = "RunGrantWire")]
pub enum RunGrantSpec {
    All,
    Grants {
        paths: Vec<String>,
        commands: Vec<String>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RunGrantWire {
    Literal(String),
    Grants {
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default)]
        commands: Vec<String>,
    },
}

impl TryFrom<RunGrantWire> for RunGrantSpec {
    type Error = String;

    fn try_from(wire: RunGrantWire) -> Result<Self, Self::Error> {
        match wire {
            RunGrantWire::Literal(s) if s == "all" => Ok(RunGrantSpec::All),
            RunGrantWire::Literal(s) => {
                Err(format!("unknown run literal '{s}' (expected \"all\")"))
            }
            RunGrantWire::Grants { paths, commands } => Ok(RunGrantSpec::Grants { paths, commands }),
        }
    }
}

impl From<RunGrantSpec> for RunGrantWire {
    fn from(spec: RunGrantSpec) -> Self {
        match spec {
            RunGrantSpec::All => RunGrantWire::Literal("all".into()),
            RunGrantSpec::Grants { paths, commands } => RunGrantWire::Grants { paths, commands },
        }
    }
}

/// A declared permission set. Absent scopes mean "grant nothing" for
/// declarations and "no further narrowing" for overlay layers; the engine
/// decides which reading applies per layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSpec {
    /// Anchor for relative path grants. Defaults to the host-supplied root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<GrantSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<GrantSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<GrantSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<GrantSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunGrantSpec>,
}

impl PermissionSpec {
    /// A spec granting every scope. Used as the host layer for root runs.
    pub fn allow_all() -> Self {
        Self {
            base_dir: None,
            read: Some(GrantSpec::All),
            write: Some(GrantSpec::All),
            net: Some(GrantSpec::All),
            env: Some(GrantSpec::All),
            run: Some(RunGrantSpec::All),
        }
    }

    /// A spec granting nothing.
    pub fn deny_all() -> Self {
        Self::default()
    }
}

/// Which composition layer a trace entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLayer {
    Parent,
    Workspace,
    Declaration,
    Reference,
    Session,
}

/// One step of the layered intersection: the set the layer requested and
/// the effective set after applying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionLayerTrace {
    pub layer: PermissionLayer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested: Option<PermissionSpec>,
    pub effective: PermissionSpec,
}
