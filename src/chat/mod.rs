//! Per-conversation state and the window that drives it.

pub mod read_state;
pub mod store;
pub mod subscription;
pub mod typing;
pub mod window;

pub use window::{ChatOptions, ChatWindow, Collaborators, Counterpart, ViewUpdate};
