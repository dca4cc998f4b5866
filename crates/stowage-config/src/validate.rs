//! Parsing helpers for individual variables.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{ConfigError, ConfigResult};

pub(crate) fn parse_positive_u64(field: &'static str, raw: &str) -> ConfigResult<u64> {
    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::invalid(field, "not_an_integer", raw))?;
    if value == 0 {
        return Err(ConfigError::invalid(field, "must_be_positive", raw));
    }
    Ok(value)
}

pub(crate) fn parse_seconds(field: &'static str, raw: &str) -> ConfigResult<Duration> {
    parse_positive_u64(field, raw).map(Duration::from_secs)
}

pub(crate) fn parse_dir(field: &'static str, raw: &str) -> ConfigResult<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::invalid(field, "empty_path", raw));
    }
    let path = PathBuf::from(trimmed);
    if !path.is_absolute() {
        return Err(ConfigError::invalid(field, "must_be_absolute", raw));
    }
    Ok(path)
}

pub(crate) fn parse_rpc_url(field: &'static str, raw: &str) -> ConfigResult<Url> {
    let url = Url::parse(raw.trim()).map_err(|_| ConfigError::invalid(field, "invalid_url", raw))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ConfigError::invalid(field, "unsupported_scheme", raw)),
    }
}

pub(crate) fn parse_log_format(field: &'static str, raw: &str) -> ConfigResult<String> {
    let label = raw.trim().to_ascii_lowercase();
    match label.as_str() {
        "json" | "pretty" => Ok(label),
        _ => Err(ConfigError::invalid(field, "unknown_log_format", raw)),
    }
}
