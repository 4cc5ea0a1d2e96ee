//! Plain-text presentation helpers for the `siteback` binary.

pub mod prompt;
pub mod render;
