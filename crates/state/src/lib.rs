//! Saved-state shaping: the resumable conversation envelope, stable
//! message refs, the chat ⇄ responses projection, and the
//! snapshot-publishing handle the runtime works through.

pub mod handle;
pub mod projection;
pub mod saved_state;

pub use handle::{StateHandle, StateUpdateSink};
pub use projection::{items_to_messages, messages_to_items};
pub use saved_state::{MessageRef, SavedState, StateFormat};
