//! Subcommand implementations.

pub mod check;
pub mod schema;
pub mod serve;
pub mod validate;
