//! Configuration for metriq query execution.
//!
//! The configuration is read from `config.yml` within a config folder. All sections are optional
//! and fall back to their defaults:
//!
//! ```yaml
//! logging:
//!   level: info
//!   format: auto
//! limits:
//!   max_queries_per_request: 100
//!   max_search_expressions: 5
//!   max_high_resolution_datapoints: 21600
//! dispatch:
//!   region_failure: abort
//!   request_timeout: 30
//! ```
//!
//! Selected values can be overridden from the environment, see [`extract_config_env_vars`].

#![warn(missing_docs)]

mod config;
mod overrides;

pub use self::config::*;
pub use self::overrides::*;
