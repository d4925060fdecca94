//! The capability lattice: normalization of declared permission specs,
//! intersection-only layered composition, and path/run/command checks.
//!
//! The governing invariant is monotonic narrowing — for every descent
//! step, `effective(child) ⊆ effective(parent)` componentwise. It holds by
//! construction because composition is intersection-only.

pub mod checks;
pub mod effective;
pub mod scope;

pub use checks::{canonicalize_lenient, lexical_normalize};
pub use effective::{resolve, EffectivePermissions, PermissionLayers};
pub use scope::{RunScope, Scope};
