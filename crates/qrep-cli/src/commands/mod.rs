//! CLI command implementations.

pub mod common;
pub mod optimize;
pub mod simulate;
pub mod version;
