//! Flat dotted-path configuration store backed by a TOML file.
//!
//! Keys are read with typed accessors that fall back to a caller-supplied
//! default and log a warning rather than fail, per the config-missing rule
//! in the error handling design. Secrets (`api/key`, `api/secret`) may be
//! overridden by environment variables of the form
//! `BOXSCAN_API_KEY` (dotted path uppercased, `/` replaced with `_`).
//!
//! The backing TOML value lives behind a `RwLock` and is re-read from disk
//! whenever the file's mtime has advanced since the last load, so a
//! refreshed auth token written by [`Config::set_auth_token`] is observed by
//! the next call without a process restart.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config file {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: toml::ser::Error,
    },
}

struct Loaded {
    value: toml::Value,
    mtime: Option<SystemTime>,
}

/// Dotted-path key/value configuration store.
pub struct Config {
    path: PathBuf,
    inner: RwLock<Loaded>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config").field("path", &self.path).finish()
    }
}

impl Config {
    /// Load a config store from a TOML file. The file need not exist; a
    /// missing file is treated as an empty table so every lookup falls back
    /// to its default.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let (value, mtime) = Self::read(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(Loaded { value, mtime }),
        })
    }

    fn read(path: &Path) -> Result<(toml::Value, Option<SystemTime>), ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let value: toml::Value = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
                let mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
                Ok((value, mtime))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok((toml::Value::Table(Default::default()), None))
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Re-read the backing file if its mtime has advanced since the last
    /// load. Errors are swallowed (the in-memory value remains authoritative)
    /// matching the cache-i/o-failure policy.
    fn refresh_if_stale(&self) {
        let current_mtime = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        let needs_reload = {
            let guard = self.inner.read().unwrap();
            current_mtime.is_some() && current_mtime != guard.mtime
        };
        if !needs_reload {
            return;
        }
        match Self::read(&self.path) {
            Ok((value, mtime)) => {
                let mut guard = self.inner.write().unwrap();
                guard.value = value;
                guard.mtime = mtime;
            }
            Err(e) => warn!(error = %e, "config hot-reread failed, keeping in-memory value"),
        }
    }

    fn env_override(dotted_path: &str) -> Option<String> {
        let var_name = format!(
            "BOXSCAN_{}",
            dotted_path.to_ascii_uppercase().replace('/', "_")
        );
        env::var(var_name).ok()
    }

    fn lookup(&self, dotted_path: &str) -> Option<toml::Value> {
        if let Some(v) = Self::env_override(dotted_path) {
            return Some(toml::Value::String(v));
        }
        self.refresh_if_stale();
        let guard = self.inner.read().unwrap();
        let mut cursor = &guard.value;
        for segment in dotted_path.split('/') {
            cursor = cursor.get(segment)?;
        }
        Some(cursor.clone())
    }

    pub fn get_string(&self, dotted_path: &str, default: &str) -> String {
        match self.lookup(dotted_path) {
            Some(toml::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => {
                warn!(key = dotted_path, "config key missing, using default");
                default.to_string()
            }
        }
    }

    pub fn get_i64(&self, dotted_path: &str, default: i64) -> i64 {
        match self.lookup(dotted_path).and_then(|v| v.as_integer()) {
            Some(v) => v,
            None => {
                warn!(key = dotted_path, "config key missing or wrong type, using default");
                default
            }
        }
    }

    pub fn get_f64(&self, dotted_path: &str, default: f64) -> f64 {
        match self.lookup(dotted_path).and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64))) {
            Some(v) => v,
            None => {
                warn!(key = dotted_path, "config key missing or wrong type, using default");
                default
            }
        }
    }

    pub fn get_bool(&self, dotted_path: &str, default: bool) -> bool {
        match self.lookup(dotted_path).and_then(|v| v.as_bool()) {
            Some(v) => v,
            None => {
                warn!(key = dotted_path, "config key missing or wrong type, using default");
                default
            }
        }
    }

    /// Rewrite `auth/access_token` and `auth/expiry` and persist the file in
    /// place (write-to-temp, rename). The only documented runtime mutation
    /// of the config file.
    pub fn set_auth_token(&self, token: &str, expiry_unix: i64) -> Result<(), ConfigError> {
        let mut guard = self.inner.write().unwrap();
        let table = guard
            .value
            .as_table_mut()
            .expect("config root must be a table");
        let auth = table
            .entry("auth".to_string())
            .or_insert_with(|| toml::Value::Table(Default::default()));
        let auth_table = auth.as_table_mut().expect("auth must be a table");
        auth_table.insert("access_token".to_string(), toml::Value::String(token.to_string()));
        auth_table.insert("expiry".to_string(), toml::Value::Integer(expiry_unix));

        let serialized = toml::to_string_pretty(&guard.value).map_err(|source| ConfigError::Serialize {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp_path = self.path.with_extension("toml.tmp");
        fs::write(&tmp_path, serialized).map_err(|source| ConfigError::Io {
            path: tmp_path.display().to_string(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        guard.mtime = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        Ok(())
    }

    /// Clear the in-memory auth token without touching the file, forcing the
    /// next [`Config::get_string`]("auth/access_token") to observe an empty
    /// credential until the on-disk file is rewritten.
    pub fn invalidate_auth_token(&self) {
        let mut guard = self.inner.write().unwrap();
        if let Some(table) = guard.value.as_table_mut() {
            if let Some(auth) = table.get_mut("auth").and_then(|v| v.as_table_mut()) {
                auth.remove("access_token");
            }
        }
    }
}
