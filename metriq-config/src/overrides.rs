//! Functionality to override the configuration with environment variables.

use std::env;

/// Environment variable overriding the log level.
pub const LOG_LEVEL_VAR: &str = "METRIQ_LOG_LEVEL";
/// Environment variable overriding the region failure policy.
pub const REGION_FAILURE_VAR: &str = "METRIQ_REGION_FAILURE";
/// Environment variable overriding the request timeout in seconds.
pub const REQUEST_TIMEOUT_VAR: &str = "METRIQ_REQUEST_TIMEOUT";

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
///
/// Values are kept as raw strings and validated in
/// [`Config::apply_override`](crate::Config::apply_override).
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The log level, such as `debug`.
    pub log_level: Option<String>,
    /// The region failure policy, `abort` or `isolate`.
    pub region_failure: Option<String>,
    /// The request timeout in seconds.
    pub request_timeout: Option<String>,
}

/// Extract config arguments from a lookup function.
fn extract_config_vars<F>(lookup: F) -> OverridableConfig
where
    F: Fn(&str) -> Option<String>,
{
    OverridableConfig {
        log_level: lookup(LOG_LEVEL_VAR),
        region_failure: lookup(REGION_FAILURE_VAR),
        request_timeout: lookup(REQUEST_TIMEOUT_VAR),
    }
}

/// Extract config arguments from environment variables.
pub fn extract_config_env_vars() -> OverridableConfig {
    extract_config_vars(|name| env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_extract_config_vars() {
        let vars = HashMap::from([
            (LOG_LEVEL_VAR, "debug"),
            (REGION_FAILURE_VAR, "isolate"),
        ]);

        let overrides = extract_config_vars(|name| vars.get(name).map(|v| (*v).to_owned()));
        assert_eq!(overrides.log_level.as_deref(), Some("debug"));
        assert_eq!(overrides.region_failure.as_deref(), Some("isolate"));
        assert_eq!(overrides.request_timeout, None);
    }
}
