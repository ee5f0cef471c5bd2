use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use metriq_log::{Level, LogConfig};
use metriq_query::{BatchLimits, DispatchConfig, RegionFailurePolicy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::overrides::OverridableConfig;

type BoxError = Box<dyn Error + Send + Sync>;

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<BoxError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: Some(inner.into()),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Into<BoxError>,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => write!(f, "{}", self.kind),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

enum ConfigFormat {
    Yaml,
}

impl ConfigFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yml",
        }
    }
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The format in which to serialize this configuration.
    fn format() -> ConfigFormat;

    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.{}", Self::name(), Self::format().extension()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::from_reader(io::BufReader::new(f))
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path)),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

/// Controls how batches are sent to regions.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Dispatch {
    /// What happens to the execution when a region rejects a request.
    region_failure: RegionFailurePolicy,
    /// Timeout of a single request in seconds. `0` disables the timeout.
    #[serde(default = "default_request_timeout")]
    request_timeout: u64,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            region_failure: RegionFailurePolicy::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    logging: LogConfig,
    #[serde(default)]
    limits: BatchLimits,
    #[serde(default)]
    dispatch: Dispatch,
}

impl ConfigObject for ConfigValues {
    fn format() -> ConfigFormat {
        ConfigFormat::Yaml
    }

    fn name() -> &'static str {
        "config"
    }
}

impl ConfigValues {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_queries_per_request == 0 {
            let error = ConfigError::new(ConfigErrorKind::InvalidValue);
            return Err(error.field("limits.max_queries_per_request"));
        }

        if self.limits.max_search_expressions == 0 {
            let error = ConfigError::new(ConfigErrorKind::InvalidValue);
            return Err(error.field("limits.max_search_expressions"));
        }

        Ok(())
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Loads a config from a given config folder.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = ConfigValues::load(&path)?;
        values.validate().map_err(|e| e.file(&path))?;

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values: ConfigValues = serde_json::from_value(value)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?;
        values.validate()?;

        Ok(Config {
            values,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(&mut self, overrides: OverridableConfig) -> Result<&mut Self, ConfigError> {
        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<Level>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(policy) = overrides.region_failure {
            self.values.dispatch.region_failure = policy
                .parse::<RegionFailurePolicy>()
                .map_err(|err| ConfigError::for_field(err, "region_failure"))?;
        }

        if let Some(timeout) = overrides.request_timeout {
            self.values.dispatch.request_timeout = timeout
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "request_timeout"))?;
        }

        Ok(self)
    }

    /// Returns the path of the config folder, if loaded from disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Initializes the logging system with the configured level and format.
    pub fn init_logging(&self) {
        metriq_log::init(self.logging());
        metriq_log::debug!(path = %self.path.display(), "logging initialized");
    }

    /// Returns the limits applied when packing batches.
    pub fn limits(&self) -> BatchLimits {
        self.values.limits
    }

    /// Returns the timeout of a single request, if enabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.values.dispatch.request_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns the parameters of the region dispatcher.
    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            region_failure: self.values.dispatch.region_failure,
            request_timeout: self.request_timeout(),
        }
    }
}
