//! Command implementations.

pub mod clean;
pub mod completions;
pub mod info;
pub mod init;
pub mod migrate;
pub mod open;
pub mod target;
pub mod version;
