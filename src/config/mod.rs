//! Configuration module

pub mod cli;
pub mod load_config;

pub use cli::{CliArgs, DispatchModel};
pub use load_config::{CyclingRange, LoadConfig, MsRange, UrlConfig};
