//! The worker sandbox bridge: deck inspection, compute execution, and
//! orchestration execution in isolated contexts behind a nonce-guarded
//! message protocol.

pub mod bootstrap;
pub mod bridge;
pub mod local;
pub mod protocol;

pub use bridge::{WorkerChannel, WorkerHost, WorkerKind, WorkerLaunch};
pub use local::LocalWorkerHost;
pub use protocol::{DeckManifest, HostMessage, WorkerMessage};

/// Upper bound on a deck-inspection worker's lifetime.
pub const INSPECT_WORKER_TIMEOUT_MS: u64 = 10_000;
