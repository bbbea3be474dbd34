//! Application configuration loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fetchkeeper_core::{DatabaseOptions, EngineConfig, RootPreference};

/// `key = value` file configuration layered under CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Base directory holding the database and the default storage roots.
    pub data_dir: Option<PathBuf>,
    /// Primary external volume mount point.
    pub primary_volume: Option<PathBuf>,
    pub max_concurrent_downloads: Option<usize>,
    pub max_retries: Option<u32>,
    pub max_redirects: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    /// Access points that force segmented transfers.
    pub segment_access_points: Option<Vec<String>>,
    pub mobile_max_bytes: Option<u64>,
    pub root_preference: Option<RootPreference>,
    /// Optional database pool max connections (1..=20).
    pub db_max_connections: Option<u32>,
    /// Optional database busy timeout in milliseconds.
    pub db_busy_timeout_ms: Option<u32>,
}

impl FileConfig {
    /// Validates config values against engine and database constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.max_concurrent_downloads
            && !(1..=100).contains(&concurrency)
        {
            bail!(
                "Invalid config value for `max_concurrent_downloads`: {concurrency}. Expected range: 1..=100"
            );
        }
        if let Some(redirects) = self.max_redirects
            && redirects > 20
        {
            bail!("Invalid config value for `max_redirects`: {redirects}. Expected range: 0..=20");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        if let Some(max_connections) = self.db_max_connections
            && !(1..=20).contains(&max_connections)
        {
            bail!(
                "Invalid config value for `db_max_connections`: {max_connections}. Expected range: 1..=20"
            );
        }
        if let Some(busy) = self.db_busy_timeout_ms
            && busy > 120_000
        {
            bail!("Invalid config value for `db_busy_timeout_ms`: {busy}. Expected range: 0..=120000");
        }
        Ok(())
    }

    /// Applies file values over `config`.
    pub fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(value) = self.max_concurrent_downloads {
            config.max_concurrent_downloads = value;
        }
        if let Some(value) = self.max_retries {
            config.max_retries = value;
        }
        if let Some(value) = self.max_redirects {
            config.max_redirects = value;
        }
        if let Some(value) = self.connect_timeout_secs {
            config.connect_timeout_secs = value;
        }
        if let Some(value) = self.read_timeout_secs {
            config.read_timeout_secs = value;
        }
        if let Some(points) = &self.segment_access_points {
            config.segment_access_points.clone_from(points);
        }
        if self.mobile_max_bytes.is_some() {
            config.mobile_max_bytes = self.mobile_max_bytes;
        }
        if let Some(preference) = &self.root_preference {
            config.root_preference = preference.clone();
        }
    }

    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        let defaults = DatabaseOptions::default();
        DatabaseOptions {
            max_connections: self.db_max_connections.unwrap_or(defaults.max_connections),
            busy_timeout_ms: self.db_busy_timeout_ms.unwrap_or(defaults.busy_timeout_ms),
        }
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/fetchkeeper/config.toml`
/// 2. `$HOME/.config/fetchkeeper/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("fetchkeeper")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("fetchkeeper")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist; the default path is optional.
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match resolve_default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(FileConfig::default()),
        },
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "data_dir" => {
                cfg.data_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "primary_volume" => {
                cfg.primary_volume = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "max_concurrent_downloads" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.max_concurrent_downloads = Some(usize::try_from(parsed).with_context(invalid)?);
            }
            "max_retries" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.max_retries = Some(u32::try_from(parsed).with_context(invalid)?);
            }
            "max_redirects" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.max_redirects = Some(u32::try_from(parsed).with_context(invalid)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "segment_access_points" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.segment_access_points = Some(
                    parsed
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                );
            }
            "mobile_max_bytes" => {
                cfg.mobile_max_bytes = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "root_preference" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.root_preference = Some(parse_root_preference(&parsed).with_context(|| {
                    format!("Invalid `root_preference` value '{parsed}' on line {line_no}")
                })?);
            }
            "db_max_connections" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.db_max_connections = Some(
                    u32::try_from(parsed)
                        .map_err(|_| anyhow::anyhow!("db_max_connections out of range for u32"))?,
                );
            }
            "db_busy_timeout_ms" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.db_busy_timeout_ms = Some(
                    u32::try_from(parsed)
                        .map_err(|_| anyhow::anyhow!("db_busy_timeout_ms out of range for u32"))?,
                );
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_root_preference(value: &str) -> Result<RootPreference> {
    match value {
        "auto" => Ok(RootPreference::Auto),
        "internal" => Ok(RootPreference::Internal),
        "external" => Ok(RootPreference::External),
        other => match other.strip_prefix("custom:") {
            Some(dir) if !dir.is_empty() => Ok(RootPreference::Custom(PathBuf::from(dir))),
            _ => bail!("Expected auto, internal, external or custom:<dir>"),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_full_file() {
        let cfg = parse_config_str(
            r#"
            # fetchkeeper defaults
            data_dir = "/var/lib/fetchkeeper"
            max_concurrent_downloads = 4
            max_retries = 5   # transient failures
            read_timeout_secs = 60
            segment_access_points = "wap.example, mms.example"
            mobile_max_bytes = 1048576
            root_preference = "custom:/mnt/media"
            db_busy_timeout_ms = 2000
            "#,
        )
        .unwrap();

        assert_eq!(cfg.data_dir, Some(PathBuf::from("/var/lib/fetchkeeper")));
        assert_eq!(cfg.max_concurrent_downloads, Some(4));
        assert_eq!(cfg.max_retries, Some(5));
        assert_eq!(cfg.read_timeout_secs, Some(60));
        assert_eq!(
            cfg.segment_access_points,
            Some(vec!["wap.example".to_string(), "mms.example".to_string()])
        );
        assert_eq!(cfg.mobile_max_bytes, Some(1_048_576));
        assert_eq!(
            cfg.root_preference,
            Some(RootPreference::Custom(PathBuf::from("/mnt/media")))
        );
        assert_eq!(cfg.database_options().busy_timeout_ms, 2000);
    }

    #[test]
    fn test_parse_config_rejects_unknown_key() {
        let err = parse_config_str("colour = \"blue\"").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("max_retries 3").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_config_rejects_out_of_range_values() {
        assert!(parse_config_str("max_concurrent_downloads = 0").is_err());
        assert!(parse_config_str("max_concurrent_downloads = 101").is_err());
        assert!(parse_config_str("connect_timeout_secs = 0").is_err());
        assert!(parse_config_str("max_redirects = 21").is_err());
        assert!(parse_config_str("db_max_connections = 50").is_err());
        assert!(parse_config_str("max_retries = -1").is_err());
    }

    #[test]
    fn test_parse_config_hash_inside_string_is_kept() {
        let cfg = parse_config_str("data_dir = \"/tmp/a#b\" # comment").unwrap();
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/a#b")));
    }

    #[test]
    fn test_apply_to_overrides_only_present_values() {
        let cfg = FileConfig {
            max_retries: Some(7),
            root_preference: Some(RootPreference::Internal),
            ..FileConfig::default()
        };
        let mut engine = EngineConfig::default();
        cfg.apply_to(&mut engine);
        assert_eq!(engine.max_retries, 7);
        assert_eq!(engine.root_preference, RootPreference::Internal);
        assert_eq!(engine.max_concurrent_downloads, 1);
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_file_config(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_redirects = 3\n").unwrap();
        let cfg = load_file_config(Some(&path)).unwrap();
        assert_eq!(cfg.max_redirects, Some(3));
    }
}
