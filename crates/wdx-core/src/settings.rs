//! Recognized-key settings store over the daemon configuration file.
//!
//! The file is a flat `key = value` list. Only the keys below are accepted;
//! missing keys fall back to their defaults, invalid values are replaced by
//! the default with a logged warning, and writes rewrite the whole file
//! through a temp file plus rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::status::StatusCode;

/// Permit unauthenticated device-scan requests (`true`/`false`).
pub const ALLOW_UNAUTHENTICATED_SCAN_DEVICES: &str =
    "allow_unauthenticated_requests_for_scan_devices";
/// Idle timeout for in-flight upload IDs, seconds, 0..=65535.
pub const FILE_API_UPLOAD_ID_TIMEOUT: &str = "file_api_upload_id_timeout";
/// Retention for asynchronous run results, seconds, 0..=65535.
pub const RUN_RESULT_TIMEOUT: &str = "run_result_timeout";
/// Origin of the upstream OAuth2 authorization server.
pub const OAUTH2_ORIGIN: &str = "oauth2_origin";
/// Absolute path of the token endpoint on the origin.
pub const OAUTH2_TOKEN_PATH: &str = "oauth2_token_path";
/// Absolute path of the introspection endpoint on the origin.
pub const OAUTH2_VERIFY_ACCESS_PATH: &str = "oauth2_verify_access_path";
/// Client identifier used towards the authorization server.
pub const OAUTH2_CLIENT_ID: &str = "oauth2_client_id";
/// Optional client secret; empty disables Basic authentication.
pub const OAUTH2_CLIENT_SECRET: &str = "oauth2_client_secret";

const RECOGNIZED_KEYS: &[&str] = &[
    ALLOW_UNAUTHENTICATED_SCAN_DEVICES,
    FILE_API_UPLOAD_ID_TIMEOUT,
    RUN_RESULT_TIMEOUT,
    OAUTH2_ORIGIN,
    OAUTH2_TOKEN_PATH,
    OAUTH2_VERIFY_ACCESS_PATH,
    OAUTH2_CLIENT_ID,
    OAUTH2_CLIENT_SECRET,
];

fn default_for(key: &str) -> &'static str {
    match key {
        ALLOW_UNAUTHENTICATED_SCAN_DEVICES => "true",
        FILE_API_UPLOAD_ID_TIMEOUT => "3600",
        RUN_RESULT_TIMEOUT => "900",
        OAUTH2_ORIGIN => "http://localhost",
        OAUTH2_TOKEN_PATH => "/auth/token",
        OAUTH2_VERIFY_ACCESS_PATH => "/auth/verify",
        OAUTH2_CLIENT_ID => "paramd",
        _ => "",
    }
}

fn is_recognized(key: &str) -> bool {
    RECOGNIZED_KEYS.contains(&key)
}

fn value_is_valid(key: &str, value: &str) -> bool {
    match key {
        ALLOW_UNAUTHENTICATED_SCAN_DEVICES => value == "true" || value == "false",
        FILE_API_UPLOAD_ID_TIMEOUT | RUN_RESULT_TIMEOUT => {
            value.parse::<u64>().is_ok_and(|n| n <= u64::from(u16::MAX))
        }
        _ => true,
    }
}

/// Settings store bound to one configuration file.
pub struct SettingsStore {
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl SettingsStore {
    /// Binds the store to the configuration file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_lock: Mutex::new(()),
        }
    }

    /// Path of the backing configuration file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads one recognized setting, applying the default for missing or
    /// invalid values.
    pub fn get_setting(&self, key: &str) -> ServiceResult<String> {
        if !is_recognized(key) {
            return Err(ServiceError::logic(format!("unknown setting \"{key}\"")));
        }

        let value = {
            let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let content = fs::read_to_string(&self.path).map_err(|error| {
                ServiceError::file_not_accessible(
                    &format!("failed to open config file \"{}\"", self.path.display()),
                    &error,
                )
            })?;
            find_value(&content, key)
        };

        match value {
            None => {
                let fallback = default_for(key);
                info!(
                    key,
                    default = fallback,
                    "setting not specified in config file, applying default"
                );
                Ok(fallback.to_owned())
            }
            Some(value) if !value_is_valid(key, &value) => {
                let fallback = default_for(key);
                warn!(
                    key,
                    value,
                    default = fallback,
                    "malformed config value, applying default"
                );
                Ok(fallback.to_owned())
            }
            Some(value) => Ok(value),
        }
    }

    /// Writes one recognized setting, rewriting the file atomically.
    pub fn write_setting(&self, key: &str, value: &str) -> ServiceResult<()> {
        if !is_recognized(key) {
            return Err(ServiceError::logic(format!("unknown setting \"{key}\"")));
        }
        if !value_is_valid(key, value) {
            return Err(ServiceError::new(
                StatusCode::InvalidValue,
                format!("invalid value \"{value}\" for setting \"{key}\""),
            ));
        }

        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let content = fs::read_to_string(&self.path).unwrap_or_default();
        let mut rewritten = String::new();
        let mut replaced = false;
        for line in content.lines() {
            if line_key(line) == Some(key) {
                replaced = true;
                rewritten.push_str(&format!("{key} = {value}\n"));
            } else {
                rewritten.push_str(line);
                rewritten.push('\n');
            }
        }
        if !replaced {
            rewritten.push_str(&format!("{key} = {value}\n"));
        }

        let temp_path = self.path.with_extension("conf.tmp");
        let result = write_and_swap(&temp_path, &self.path, rewritten.as_bytes());
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

fn write_and_swap(temp_path: &Path, final_path: &Path, content: &[u8]) -> ServiceResult<()> {
    let mut file = fs::File::create(temp_path).map_err(|error| {
        ServiceError::file_not_accessible(
            &format!("failed to open temporary file \"{}\"", temp_path.display()),
            &error,
        )
    })?;
    file.write_all(content)
        .and_then(|()| file.sync_all())
        .map_err(|error| {
            ServiceError::file_not_accessible("failed to write temporary config file", &error)
        })?;
    drop(file);
    fs::rename(temp_path, final_path).map_err(|error| {
        ServiceError::file_not_accessible("failed to overwrite config file", &error)
    })
}

fn line_key(line: &str) -> Option<&str> {
    let stripped = line.trim();
    let (key, _) = stripped.split_once('=')?;
    Some(key.trim_end())
}

fn find_value(content: &str, key: &str) -> Option<String> {
    for line in content.lines() {
        // blanks are insignificant anywhere in a line
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if let Some((candidate, value)) = compact.split_once('=')
            && candidate == key
            && !value.is_empty()
        {
            return Some(value.to_owned());
        }
    }
    None
}
