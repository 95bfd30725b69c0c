//! Transcript streaming for viewers that render the raw record stream
//! themselves (replay plus live tail), independent of the terminal engine.

pub mod pruning;
pub mod watcher;

pub use watcher::{AttachGuard, StreamWatcher};
