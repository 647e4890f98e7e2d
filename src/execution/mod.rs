//! Subprocess orchestration.

pub mod command;

pub use command::{CapturedCommand, CapturedOutput, MountSpec};
