pub mod flow_control;
pub mod manager;
pub mod terminal;
pub mod watch;

pub use flow_control::FlowControlConfig;
pub use manager::{ChangeCallback, ListenerId, TerminalError, TerminalManager, TerminalSettings};
pub use terminal::{HeadlessTerminal, TerminalSize};
