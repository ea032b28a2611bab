//! Library for the `sift` command-line interface.

pub mod commands;
pub mod config;
pub mod output;

pub use config::SiftConfig;
pub use output::OutputFormat;
