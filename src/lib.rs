//! Real-time messaging core for a classifieds marketplace: buyer and seller
//! chat about one ad, with live delivery, typing presence and read receipts.

pub mod api;
pub mod app;
pub mod chat;
pub mod error;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod testing;

pub use app::AppState;
pub use chat::{ChatOptions, ChatWindow, Collaborators, Counterpart, ViewUpdate};
pub use error::ChatError;
