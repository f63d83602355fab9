//! Built-in stage handlers that need the host environment.

pub mod shell;

pub use shell::ShellStage;
