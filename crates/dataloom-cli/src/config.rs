use std::path::{Path, PathBuf};

use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dataloom_core::{NamespaceNames, Strictness, redact_dsn};
use dataloom_load::{LoadOptions, ResetMode};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dataloom.toml";
const ENV_PREFIX: &str = "DATALOOM_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("missing setting: {0}")]
    Missing(&'static str),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Effective settings: file, then `DATALOOM_*` variables, then flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub dsn: Option<String>,
    pub catalog: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub run_dir: PathBuf,
    pub reset: ResetMode,
    pub strictness: Strictness,
    pub chunk_size: usize,
    pub ddl_only: bool,
    pub dry_run: bool,
    pub resume: bool,
    pub analyze: bool,
    pub timezone: Option<String>,
    pub extensions: Vec<String>,
    pub post_sql: Vec<PathBuf>,
    pub log_level: String,
    pub namespaces: NamespaceNames,
}

impl Default for Settings {
    fn default() -> Self {
        let load = LoadOptions::default();
        Self {
            dsn: None,
            catalog: None,
            data_dir: None,
            run_dir: PathBuf::from("runs"),
            reset: load.reset,
            strictness: load.strictness,
            chunk_size: load.chunk_size,
            ddl_only: false,
            dry_run: false,
            resume: false,
            analyze: false,
            timezone: None,
            extensions: Vec::new(),
            post_sql: Vec::new(),
            log_level: "info".to_string(),
            namespaces: NamespaceNames::default(),
        }
    }
}

/// Values given on the command line; `None`/`false` leaves the setting alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub dsn: Option<String>,
    pub catalog: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub run_dir: Option<PathBuf>,
    pub reset: Option<ResetMode>,
    pub strictness: Option<Strictness>,
    pub chunk_size: Option<usize>,
    pub ddl_only: bool,
    pub dry_run: bool,
    pub resume: bool,
    pub analyze: bool,
    pub post_sql: Vec<PathBuf>,
    pub log_level: Option<String>,
}

fn parse_enum<T: DeserializeOwned>(key: &str, value: &str) -> ConfigResult<T> {
    let normalized = value.trim().to_lowercase();
    let deserializer: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
        normalized.as_str().into_deserializer();
    T::deserialize(deserializer).map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read the configuration file. An explicit path must exist; the default
    /// file is optional.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Apply `DATALOOM_*` variables, with `DATABASE_URL` as DSN fallback.
    pub fn apply_env<I>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut database_url = None;
        for (key, value) in vars {
            if key == "DATABASE_URL" {
                database_url = Some(value);
                continue;
            }
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "DSN" => self.dsn = Some(value),
                "CATALOG" => self.catalog = Some(PathBuf::from(value)),
                "DATA_DIR" => self.data_dir = Some(PathBuf::from(value)),
                "RUN_DIR" => self.run_dir = PathBuf::from(value),
                "RESET" => self.reset = parse_enum(&key, &value)?,
                "STRICTNESS" => self.strictness = parse_enum(&key, &value)?,
                "CHUNK_SIZE" => {
                    self.chunk_size = value
                        .trim()
                        .parse()
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| invalid(&key, &value))?;
                }
                "DDL_ONLY" => self.ddl_only = parse_bool(&key, &value)?,
                "DRY_RUN" => self.dry_run = parse_bool(&key, &value)?,
                "RESUME" => self.resume = parse_bool(&key, &value)?,
                "ANALYZE" => self.analyze = parse_bool(&key, &value)?,
                "TIMEZONE" => self.timezone = Some(value),
                "EXTENSIONS" => self.extensions = split_list(&value),
                "POST_SQL" => {
                    self.post_sql = split_list(&value).into_iter().map(PathBuf::from).collect()
                }
                "LOG_LEVEL" => self.log_level = value,
                "NAMESPACE_BUSINESS" => self.namespaces.business = value,
                "NAMESPACE_INGEST" => self.namespaces.ingest = value,
                "NAMESPACE_AUDIT" => self.namespaces.audit = value,
                _ => {}
            }
        }
        if self.dsn.is_none() {
            self.dsn = database_url;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        let Overrides {
            dsn,
            catalog,
            data_dir,
            run_dir,
            reset,
            strictness,
            chunk_size,
            ddl_only,
            dry_run,
            resume,
            analyze,
            post_sql,
            log_level,
        } = overrides;

        if dsn.is_some() {
            self.dsn = dsn;
        }
        if catalog.is_some() {
            self.catalog = catalog;
        }
        if data_dir.is_some() {
            self.data_dir = data_dir;
        }
        if let Some(run_dir) = run_dir {
            self.run_dir = run_dir;
        }
        if let Some(reset) = reset {
            self.reset = reset;
        }
        if let Some(strictness) = strictness {
            self.strictness = strictness;
        }
        if let Some(chunk_size) = chunk_size {
            self.chunk_size = chunk_size.max(1);
        }
        self.ddl_only |= ddl_only;
        self.dry_run |= dry_run;
        self.resume |= resume;
        self.analyze |= analyze;
        if !post_sql.is_empty() {
            self.post_sql = post_sql;
        }
        if let Some(log_level) = log_level {
            self.log_level = log_level;
        }
    }

    pub fn require_catalog(&self) -> ConfigResult<&Path> {
        self.catalog.as_deref().ok_or(ConfigError::Missing("catalog"))
    }

    pub fn require_dsn(&self) -> ConfigResult<&str> {
        self.dsn.as_deref().ok_or(ConfigError::Missing("dsn"))
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            reset: self.reset,
            strictness: self.strictness,
            chunk_size: self.chunk_size,
            ddl_only: self.ddl_only,
            resume: self.resume,
            analyze: self.analyze,
            timezone: self.timezone.clone(),
            extensions: self.extensions.clone(),
            post_sql: self.post_sql.clone(),
            namespaces: self.namespaces.clone(),
        }
    }

    /// Copy safe to print or persist: the DSN password is masked.
    pub fn redacted(&self) -> Self {
        Self {
            dsn: self.dsn.as_deref().map(|dsn| redact_dsn(dsn).redacted),
            ..self.clone()
        }
    }
}
