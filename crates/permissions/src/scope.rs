//! Scope lattice primitives.
//!
//! Each scope is either `All` or an explicit entry set; intersection with
//! `All` is the identity and intersection of sets is set intersection, so
//! composition can only narrow.

use std::collections::BTreeSet;

use gambit_domain::grants::{GrantSpec, RunGrantSpec};

/// One capability scope. Entries are absolute path strings for read/write
/// and run paths, verbatim names for net/env and run commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Set(BTreeSet<String>),
}

impl Scope {
    pub fn none() -> Self {
        Scope::Set(BTreeSet::new())
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scope::Set(entries.into_iter().map(Into::into).collect())
    }

    /// True when the scope grants nothing at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, Scope::Set(s) if s.is_empty())
    }

    /// Exact-member check (`All` accepts everything). Path containment is
    /// the checks module's business, not this one's.
    pub fn contains(&self, entry: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Set(s) => s.contains(entry),
        }
    }

    pub fn intersect(&self, other: &Scope) -> Scope {
        match (self, other) {
            (Scope::All, _) => other.clone(),
            (_, Scope::All) => self.clone(),
            (Scope::Set(a), Scope::Set(b)) => Scope::Set(a.intersection(b).cloned().collect()),
        }
    }

    pub fn is_subset_of(&self, other: &Scope) -> bool {
        match (self, other) {
            (_, Scope::All) => true,
            (Scope::All, Scope::Set(_)) => false,
            (Scope::Set(a), Scope::Set(b)) => a.is_subset(b),
        }
    }

    pub fn entries(&self) -> Option<&BTreeSet<String>> {
        match self {
            Scope::All => None,
            Scope::Set(s) => Some(s),
        }
    }

    pub fn to_spec(&self) -> GrantSpec {
        match self {
            Scope::All => GrantSpec::All,
            Scope::Set(s) => GrantSpec::Entries(s.iter().cloned().collect()),
        }
    }
}

/// The run scope: executable path grants and bare command-name grants,
/// intersected componentwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    All,
    Grants {
        paths: BTreeSet<String>,
        commands: BTreeSet<String>,
    },
}

impl RunScope {
    pub fn none() -> Self {
        RunScope::Grants {
            paths: BTreeSet::new(),
            commands: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RunScope::Grants { paths, commands } if paths.is_empty() && commands.is_empty())
    }

    pub fn intersect(&self, other: &RunScope) -> RunScope {
        match (self, other) {
            (RunScope::All, _) => other.clone(),
            (_, RunScope::All) => self.clone(),
            (
                RunScope::Grants {
                    paths: ap,
                    commands: ac,
                },
                RunScope::Grants {
                    paths: bp,
                    commands: bc,
                },
            ) => RunScope::Grants {
                paths: ap.intersection(bp).cloned().collect(),
                commands: ac.intersection(bc).cloned().collect(),
            },
        }
    }

    pub fn is_subset_of(&self, other: &RunScope) -> bool {
        match (self, other) {
            (_, RunScope::All) => true,
            (RunScope::All, RunScope::Grants { .. }) => false,
            (
                RunScope::Grants {
                    paths: ap,
                    commands: ac,
                },
                RunScope::Grants {
                    paths: bp,
                    commands: bc,
                },
            ) => ap.is_subset(bp) && ac.is_subset(bc),
        }
    }

    pub fn to_spec(&self) -> RunGrantSpec {
        match self {
            RunScope::All => RunGrantSpec::All,
            RunScope::Grants { paths, commands } => RunGrantSpec::Grants {
                paths: paths.iter().cloned().collect(),
                commands: commands.iter().cloned().collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_identity_under_intersection() {
        let set = Scope::from_entries(["/a", "/b"]);
        assert_eq!(Scope::All.intersect(&set), set);
        assert_eq!(set.intersect(&Scope::All), set);
        assert_eq!(Scope::All.intersect(&Scope::All), Scope::All);
    }

    #[test]
    fn set_intersection_narrows() {
        let a = Scope::from_entries(["/a", "/b"]);
        let b = Scope::from_entries(["/b", "/c"]);
        assert_eq!(a.intersect(&b), Scope::from_entries(["/b"]));
    }

    #[test]
    fn subset_ordering() {
        let small = Scope::from_entries(["/a"]);
        let big = Scope::from_entries(["/a", "/b"]);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
        assert!(big.is_subset_of(&Scope::All));
        assert!(!Scope::All.is_subset_of(&big));
    }

    #[test]
    fn intersection_result_is_subset_of_both() {
        let a = Scope::from_entries(["/a", "/b", "/c"]);
        let b = Scope::from_entries(["/b", "/c", "/d"]);
        let i = a.intersect(&b);
        assert!(i.is_subset_of(&a));
        assert!(i.is_subset_of(&b));
    }

    #[test]
    fn run_scope_componentwise() {
        let a = RunScope::Grants {
            paths: ["/bin/jq".to_string()].into(),
            commands: ["git".to_string(), "ls".to_string()].into(),
        };
        let b = RunScope::Grants {
            paths: BTreeSet::new(),
            commands: ["git".to_string()].into(),
        };
        let i = a.intersect(&b);
        assert_eq!(
            i,
            RunScope::Grants {
                paths: BTreeSet::new(),
                commands: ["git".to_string()].into(),
            }
        );
        assert!(i.is_subset_of(&a));
        assert!(i.is_subset_of(&b));
    }

    #[test]
    fn empty_scope_reports_empty() {
        assert!(Scope::none().is_empty());
        assert!(!Scope::All.is_empty());
        assert!(RunScope::none().is_empty());
    }
}
