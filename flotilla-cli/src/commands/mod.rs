//! Subcommand implementations

pub mod config;
pub mod query;
pub mod run;
pub mod worker;
