pub mod common;
pub mod config;

pub use common::ToolError;
